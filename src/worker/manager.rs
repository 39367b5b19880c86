use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::comm::{AliveInfo, StatusReport};
use crate::config::{BootConfig, InstanceInfo};
use crate::error::Result;
use crate::jobmanager::{SgeBootstrap, SlurmdBootstrap};
use crate::mounts::{FsType, MountReconciler, MountSpec, MountTable, ProbeStatus};
use crate::runner::CommandRunner;
use crate::worker::pss::ServiceStatus;
use crate::worker::WorkerState;

/// Mount label implicitly added for the scheduler's shared directory.
const SCHEDULER_MOUNT_LABEL: &str = "scheduler";

/// Owns the worker's local resources: mounted shares, credentials and the
/// scheduler daemon bootstrap. All methods are invoked synchronously from the
/// supervisor's dispatch path.
pub struct WorkerManager {
    config: BootConfig,
    instance: InstanceInfo,
    runner: Arc<dyn CommandRunner>,
    reconciler: MountReconciler,
    applied_mounts: Vec<MountSpec>,
    nfs_data: ProbeStatus,
    nfs_tools: ProbeStatus,
    nfs_indices: ProbeStatus,
    nfs_sge: ProbeStatus,
    nfs_tfs: ProbeStatus,
    extra_mounts: HashMap<String, ProbeStatus>,
    cert_status: ProbeStatus,
    slurmd: SlurmdBootstrap,
    slurmd_last: ProbeStatus,
    sge: SgeBootstrap,
    alias: Option<String>,
}

impl WorkerManager {
    pub fn new(config: BootConfig, instance: InstanceInfo, runner: Arc<dyn CommandRunner>) -> Self {
        let reconciler = MountReconciler::new(runner.clone());
        let slurmd = SlurmdBootstrap::new(runner.clone(), config.paths.clone());
        let sge = SgeBootstrap::new(runner.clone(), config.paths.clone());
        Self {
            config,
            instance,
            runner,
            reconciler,
            applied_mounts: Vec::new(),
            nfs_data: ProbeStatus::Untried,
            nfs_tools: ProbeStatus::Untried,
            nfs_indices: ProbeStatus::Untried,
            nfs_sge: ProbeStatus::Untried,
            nfs_tfs: ProbeStatus::Untried,
            extra_mounts: HashMap::new(),
            cert_status: ProbeStatus::Untried,
            slurmd,
            slurmd_last: ProbeStatus::Untried,
            sge,
            alias: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance.instance_id
    }

    pub fn num_cpus(&self) -> u32 {
        self.instance.num_cpus
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn alive_info(&self) -> AliveInfo {
        AliveInfo::from(&self.instance)
    }

    /// Update the master address after a RESTART resync.
    pub fn set_master_ip(&mut self, master_ip: String) {
        self.config.master_ip = master_ip;
    }

    pub fn master_ip(&self) -> &str {
        &self.config.master_ip
    }

    /// Reconcile the supplied mount list, plus the implicit scheduler share
    /// and any extra NFS exports from the boot bundle, against the live mount
    /// table. The supplied list replaces the previously applied set.
    pub async fn apply_mounts(&mut self, specs: Vec<MountSpec>) -> Result<()> {
        let mut desired = specs;
        desired.push(MountSpec::nfs(
            SCHEDULER_MOUNT_LABEL,
            self.config.paths.sge_root.display().to_string(),
            self.config.master_ip.clone(),
        ));
        for (i, path) in self.config.extra_nfs_mounts.iter().enumerate() {
            desired.push(MountSpec::nfs(
                format!("extra_mount_{}", i),
                path.clone(),
                self.config.master_ip.clone(),
            ));
        }

        let table = self.mount_table().await;
        let outcome = self
            .reconciler
            .reconcile(&table, &self.applied_mounts, &desired)
            .await;

        for (label, status) in &outcome.statuses {
            self.record_mount_status(label, *status);
        }
        self.applied_mounts = desired;
        if outcome.failed.is_empty() {
            Ok(())
        } else {
            Err(crate::error::GridError::Mount(format!(
                "failed labels: {}",
                outcome.failed.join(", ")
            )))
        }
    }

    async fn mount_table(&self) -> MountTable {
        match MountTable::load().await {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read mount table; assuming empty");
                MountTable::default()
            }
        }
    }

    fn record_mount_status(&mut self, label: &str, status: ProbeStatus) {
        match label {
            "data" => self.nfs_data = status,
            "tools" => self.nfs_tools = status,
            "indices" => self.nfs_indices = status,
            "transient_nfs" => self.nfs_tfs = status,
            SCHEDULER_MOUNT_LABEL => self.nfs_sge = status,
            other => {
                self.extra_mounts.insert(other.to_string(), status);
            }
        }
        tracing::debug!(label, status = status.as_wire(), "Mount status updated");
    }

    /// Unmount every applied share; used on shutdown and master resync.
    pub async fn unmount_all(&mut self) {
        if self.applied_mounts.is_empty() {
            return;
        }
        tracing::info!(count = self.applied_mounts.len(), "Unmounting shares");
        self.reconciler.unmount_all(&self.applied_mounts).await;
        self.applied_mounts.clear();
    }

    /// Append the master's public key to the authorized keys file.
    pub async fn save_authorized_key(&self, key: &str) -> Result<()> {
        let path = &self.config.paths.authorized_keys;
        tracing::info!(path = %path.display(), "Saving master's authorized key");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(key.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Scan this host's RSA certificate for the master's known-hosts file.
    pub async fn collect_host_cert(&mut self) -> Option<String> {
        let cmd = format!("ssh-keyscan -t rsa {}", self.instance.fqdn());
        tracing::info!(command = %cmd, "Collecting worker host certificate");
        match self.runner.run(&cmd).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                self.cert_status = ProbeStatus::Ok;
                Some(out.stdout.lines().next().unwrap_or_default().to_string())
            }
            Ok(out) => {
                tracing::error!(exit_code = ?out.exit_code, "Host certificate scan failed");
                self.cert_status = ProbeStatus::Failed;
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Host certificate scan did not run");
                self.cert_status = ProbeStatus::Failed;
                None
            }
        }
    }

    pub async fn start_slurmd(&mut self, alias: &str) -> Result<()> {
        self.alias = Some(alias.to_string());
        let result = self.slurmd.start(alias).await;
        self.slurmd_last = if result.is_ok() {
            ProbeStatus::Ok
        } else {
            ProbeStatus::Failed
        };
        result
    }

    pub async fn start_sge(&mut self) -> Result<()> {
        let hostname = self.instance.hostname.clone();
        self.sge.start(&hostname).await
    }

    pub fn sge_status(&self) -> ProbeStatus {
        self.sge.status()
    }

    /// Probe slurmd; the bootstrap self-heals within its restart budget.
    pub async fn slurmd_status(&mut self) -> ProbeStatus {
        self.slurmd_last = self.slurmd.daemon_status().await;
        self.slurmd_last
    }

    /// Compose the NODE_STATUS heartbeat snapshot. Probing here keeps the
    /// daemon health current without a separate timer.
    pub async fn status_report(&mut self, state: WorkerState) -> StatusReport {
        let slurmd = self.slurmd_status().await;
        StatusReport {
            nfs_data: self.nfs_data,
            nfs_tools: self.nfs_tools,
            nfs_indices: self.nfs_indices,
            nfs_sge: self.nfs_sge,
            cert: self.cert_status,
            sge_daemon: self.sge.status(),
            load: load_avg().await,
            state,
            nfs_tfs: self.nfs_tfs,
            slurmd,
        }
    }

    /// Health of this worker's locally managed services, used to gate the
    /// post-start hook. Only services that have been attempted participate.
    pub fn service_health(&self) -> Vec<ServiceStatus> {
        let mut health = Vec::new();
        let mounts = [
            ("data", self.nfs_data),
            ("tools", self.nfs_tools),
            ("indices", self.nfs_indices),
            (SCHEDULER_MOUNT_LABEL, self.nfs_sge),
            ("transient_nfs", self.nfs_tfs),
        ];
        for (name, status) in mounts {
            if status != ProbeStatus::Untried {
                health.push(ServiceStatus::new(name, status.is_ok()));
            }
        }
        for (name, status) in &self.extra_mounts {
            health.push(ServiceStatus::new(name.clone(), status.is_ok()));
        }
        if self.slurmd_last != ProbeStatus::Untried {
            health.push(ServiceStatus::new("slurmd", self.slurmd_last.is_ok()));
        }
        if self.sge.status() != ProbeStatus::Untried {
            health.push(ServiceStatus::new("sge", self.sge.status().is_ok()));
        }
        health
    }

    /// Replace the local /etc/hosts with the master's published copy.
    pub async fn sync_etc_hosts(&self) -> Result<()> {
        let sync_path = self.config.paths.etc_hosts_sync.display().to_string();
        let probe = self.runner.run(&format!("test -e {}", sync_path)).await?;
        if !probe.success() {
            tracing::warn!(path = %sync_path, "Sync path not available; cannot sync /etc/hosts");
            return Ok(());
        }
        crate::jobmanager::run_checked(
            self.runner.as_ref(),
            &format!("cp {} /etc/hosts", sync_path),
        )
        .await
        .map(|_| ())
    }

    /// Attach a bucket-backed filesystem. Surfaced to the reconciler as an
    /// `other` mount; the bucket service roles are informational here.
    pub async fn add_bucket_fs(&mut self, bucket: &str, roles: &[String]) -> Result<()> {
        tracing::info!(bucket, roles = roles.join(","), "Adding bucket filesystem");
        let spec = MountSpec {
            label: bucket.to_string(),
            local_path: format!("/mnt/{}", bucket),
            fs_type: FsType::Other,
            server: bucket.to_string(),
            options: None,
        };
        let table = self.mount_table().await;
        let mut desired = self.applied_mounts.clone();
        desired.retain(|m| m.label != spec.label);
        desired.push(spec);
        let outcome = self
            .reconciler
            .reconcile(&table, &self.applied_mounts, &desired)
            .await;
        for (label, status) in &outcome.statuses {
            self.record_mount_status(label, *status);
        }
        self.applied_mounts = desired;
        Ok(())
    }

    /// OS-level reboot request, fire-and-forget: the process is expected to
    /// terminate before the result matters.
    pub async fn reboot(&self) {
        match self.runner.run("telinit 6").await {
            Ok(out) if out.success() => tracing::info!("Initiated reboot"),
            Ok(out) => tracing::warn!(exit_code = ?out.exit_code, "Problem initiating reboot"),
            Err(e) => tracing::warn!(error = %e, "Problem initiating reboot"),
        }
    }
}

async fn load_avg() -> String {
    match tokio::fs::read_to_string("/proc/loadavg").await {
        Ok(contents) => contents
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => "0.00 0.00 0.00".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use std::sync::Mutex;
    use tonic::async_trait;

    struct StubRunner {
        log: Mutex<Vec<String>>,
        fail_containing: Vec<&'static str>,
    }

    impl StubRunner {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                fail_containing: Vec::new(),
            })
        }

        fn failing(needles: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                fail_containing: needles,
            })
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(&self, cmd: &str) -> std::io::Result<CommandOutput> {
            self.log.lock().unwrap().push(cmd.to_string());
            if self.fail_containing.iter().any(|n| cmd.contains(n)) {
                Ok(CommandOutput::failed(1, "stub failure"))
            } else if cmd.starts_with("ssh-keyscan") {
                Ok(CommandOutput::ok("worker-host ssh-rsa AAAA..."))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }
    }

    fn manager(runner: Arc<StubRunner>) -> WorkerManager {
        let config = BootConfig::new("10.0.0.1");
        let mut instance = InstanceInfo::detect("i-test");
        instance.hostname = "w1.internal".to_string();
        WorkerManager::new(config, instance, runner)
    }

    #[tokio::test]
    async fn apply_mounts_records_labelled_statuses() {
        let mut mgr = manager(StubRunner::ok());
        mgr.apply_mounts(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")])
            .await
            .unwrap();
        assert_eq!(mgr.nfs_data, ProbeStatus::Ok);
        // Implicit scheduler share rides along with every MOUNT.
        assert_eq!(mgr.nfs_sge, ProbeStatus::Ok);
        assert_eq!(mgr.nfs_tools, ProbeStatus::Untried);
    }

    #[tokio::test]
    async fn failed_mount_surfaces_in_status_and_error() {
        let mut mgr = manager(StubRunner::failing(vec!["/mnt/data"]));
        let result = mgr
            .apply_mounts(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")])
            .await;
        assert!(result.is_err());
        assert_eq!(mgr.nfs_data, ProbeStatus::Failed);
        let report = mgr.status_report(WorkerState::Starting).await;
        assert_eq!(report.nfs_data, ProbeStatus::Failed);
        assert_eq!(report.state, WorkerState::Starting);
    }

    #[tokio::test]
    async fn host_cert_scan_updates_cert_status() {
        let mut mgr = manager(StubRunner::ok());
        let cert = mgr.collect_host_cert().await;
        assert_eq!(cert.as_deref(), Some("worker-host ssh-rsa AAAA..."));
        assert_eq!(mgr.cert_status, ProbeStatus::Ok);

        let mut mgr = manager(StubRunner::failing(vec!["ssh-keyscan"]));
        assert!(mgr.collect_host_cert().await.is_none());
        assert_eq!(mgr.cert_status, ProbeStatus::Failed);
    }

    #[tokio::test]
    async fn service_health_includes_only_attempted_services() {
        let mut mgr = manager(StubRunner::ok());
        assert!(mgr.service_health().is_empty());

        mgr.apply_mounts(vec![MountSpec::nfs("data", "/mnt/data", "10.0.0.1")])
            .await
            .unwrap();
        let health = mgr.service_health();
        assert!(health.iter().any(|s| s.name == "data" && s.healthy));
        assert!(health.iter().all(|s| s.name != "slurmd"));
    }
}
