//! Worker-side scheduler daemon bootstrap.
//!
//! Workers do not carry the full master-side service registry; these two
//! helpers do exactly what a fresh instance needs to join the pool: install
//! prerequisites, wire up shared configuration, start the daemon and keep it
//! alive within a bounded restart budget.

use std::sync::Arc;
use std::time::Duration;

use crate::config::ClusterPaths;
use crate::error::{GridError, Result};
use crate::jobmanager::{run_checked, RestartBudget};
use crate::mounts::ProbeStatus;
use crate::runner::CommandRunner;

const CONF_WAIT_ATTEMPTS: u32 = 10;
const CONF_WAIT_DELAY: Duration = Duration::from_secs(2);

/// Brings up `slurmd` under the master-assigned alias and probes it.
pub struct SlurmdBootstrap {
    runner: Arc<dyn CommandRunner>,
    paths: ClusterPaths,
    budget: RestartBudget,
    alias: Option<String>,
    attempted: bool,
}

impl SlurmdBootstrap {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: ClusterPaths) -> Self {
        Self {
            runner,
            paths,
            budget: RestartBudget::new(3),
            alias: None,
            attempted: false,
        }
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Configure munge and start `slurmd` as the worker named `alias`.
    pub async fn start(&mut self, alias: &str) -> Result<()> {
        tracing::info!(alias, "Configuring slurmd");
        self.alias = Some(alias.to_string());
        self.setup_munge().await?;
        self.launch().await
    }

    /// Install the cluster munge key and start the munge service. The key is
    /// created by the master on the shared filesystem; a missing key is a
    /// hard error.
    async fn setup_munge(&self) -> Result<()> {
        let runner = self.runner.as_ref();
        run_checked(
            runner,
            "test -d /etc/munge || (apt-get update && apt-get install -y munge libmunge-dev)",
        )
        .await?;
        let key_nfs = self.paths.munge_key_nfs();
        let key_local = &self.paths.munge_key_local;
        run_checked(
            runner,
            &format!("cp {} {}", key_nfs.display(), key_local.display()),
        )
        .await?;
        run_checked(
            runner,
            &format!(
                "chmod 400 {key} && chown munge:munge {key}",
                key = key_local.display()
            ),
        )
        .await?;
        run_checked(
            runner,
            "grep -q -- '--force' /etc/default/munge || \
             echo 'OPTIONS=\"--force\"' >> /etc/default/munge",
        )
        .await?;
        run_checked(runner, "service munge start").await?;
        tracing::debug!("Done setting up munge");
        Ok(())
    }

    /// Start the daemon. When many nodes join at once the master may be
    /// rewriting the shared slurm.conf, so wait for it to be non-empty and
    /// take the cluster-wide lock around the actual start.
    async fn launch(&mut self) -> Result<()> {
        let alias = self
            .alias
            .clone()
            .ok_or_else(|| GridError::Scheduler("slurmd bootstrap has no alias".to_string()))?;
        self.attempted = true;
        let runner = self.runner.as_ref();

        let conf_dir = self
            .paths
            .slurm_conf_local
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/etc/slurm-llnl".to_string());
        run_checked(
            runner,
            &format!("test -d {conf_dir} || apt-get install -y slurm-llnl"),
        )
        .await?;

        let conf_nfs = self.paths.slurm_conf_nfs();
        for attempt in 1..=CONF_WAIT_ATTEMPTS {
            match runner
                .run(&format!("test -s {}", conf_nfs.display()))
                .await
            {
                Ok(out) if out.success() => break,
                _ => {
                    tracing::debug!(
                        conf = %conf_nfs.display(),
                        attempt,
                        "slurm.conf missing or empty; waiting"
                    );
                    tokio::time::sleep(CONF_WAIT_DELAY).await;
                }
            }
        }

        // slurm-llnl does not respect a custom conf location, so link it.
        run_checked(
            runner,
            &format!(
                "test -e {local} || ln -s {nfs} {local}",
                local = self.paths.slurm_conf_local.display(),
                nfs = conf_nfs.display()
            ),
        )
        .await?;
        run_checked(
            runner,
            &format!(
                "mkdir -p {tmp} && chown slurm:slurm {tmp}",
                tmp = self.paths.slurm_root_tmp.display()
            ),
        )
        .await?;

        run_checked(
            runner,
            &format!(
                "flock {lock} /usr/sbin/slurmd -c -N {alias} -L {log}",
                lock = self.paths.slurm_lock_file().display(),
                log = self.paths.slurmd_log_file.display()
            ),
        )
        .await?;
        tracing::debug!(alias = %alias, "Started slurmd");
        Ok(())
    }

    /// Pid-file liveness probe. A healthy result resets the restart budget;
    /// an unhealthy one triggers at most one automatic restart attempt per
    /// call until the budget is spent.
    pub async fn daemon_status(&mut self) -> ProbeStatus {
        if !self.attempted {
            return ProbeStatus::Untried;
        }
        if self.probe_alive().await {
            self.budget.record_healthy();
            return ProbeStatus::Ok;
        }
        tracing::debug!("slurmd daemon is not running");
        if self.budget.try_consume() {
            tracing::debug!(
                attempt = self.budget.attempts(),
                "Automatically trying to restart slurmd"
            );
            if let Err(e) = self.launch().await {
                tracing::warn!(error = %e, "slurmd restart failed");
            }
        }
        ProbeStatus::Failed
    }

    async fn probe_alive(&self) -> bool {
        let pid = match self
            .runner
            .run(&format!(
                "head -n 1 {}",
                self.paths.slurmd_pid_file.display()
            ))
            .await
        {
            Ok(out) if out.success() => out.stdout.trim().to_string(),
            _ => return false,
        };
        if pid.is_empty() {
            return false;
        }
        match self.runner.run(&format!("ps -o pid= -p {}", pid)).await {
            Ok(out) => out.success() && out.stdout.trim() == pid,
            Err(_) => false,
        }
    }
}

/// Runs the non-interactive SGE execution-host installer. Daemon start
/// implies pool registration, so there is no separate join step.
pub struct SgeBootstrap {
    runner: Arc<dyn CommandRunner>,
    paths: ClusterPaths,
    status: ProbeStatus,
}

impl SgeBootstrap {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: ClusterPaths) -> Self {
        Self {
            runner,
            paths,
            status: ProbeStatus::Untried,
        }
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub async fn start(&mut self, local_hostname: &str) -> Result<()> {
        tracing::info!("Configuring SGE execution host");
        match self.install(local_hostname).await {
            Ok(()) => {
                self.status = ProbeStatus::Ok;
                Ok(())
            }
            Err(e) => {
                self.status = ProbeStatus::Failed;
                Err(e)
            }
        }
    }

    async fn install(&self, local_hostname: &str) -> Result<()> {
        let runner = self.runner.as_ref();
        let root = self.paths.sge_root.display();

        // SGE install fails when cloud-init's 127.0.1.* alias is present.
        run_checked(
            runner,
            "sed -i.bak '/^127.0.1./s/^/# (Commented by gridpool) /' /etc/hosts",
        )
        .await?;
        run_checked(
            runner,
            &format!(
                "grep -q SGE_ROOT /etc/profile || \
                 (echo 'export SGE_ROOT={root}' >> /etc/profile && \
                  echo '. $SGE_ROOT/default/common/settings.sh' >> /etc/profile)"
            ),
        )
        .await?;

        tokio::fs::create_dir_all(&self.paths.home).await?;
        let conf_path = self.paths.home.join("sge_install.conf");
        tokio::fs::write(&conf_path, self.install_conf(local_hostname)).await?;
        run_checked(
            runner,
            &format!("chown sgeadmin:sgeadmin {}", conf_path.display()),
        )
        .await?;

        run_checked(
            runner,
            &format!(
                "cd {root}; ./inst_sge -x -noremote -auto {}",
                conf_path.display()
            ),
        )
        .await?;
        tracing::debug!("SGE execution host configured");
        Ok(())
    }

    fn install_conf(&self, local_hostname: &str) -> String {
        format!(
            "SGE_ROOT={root}\n\
             SGE_QMASTER_PORT=6444\n\
             SGE_EXECD_PORT=6445\n\
             CELL_NAME=default\n\
             ADMIN_USER=sgeadmin\n\
             EXEC_HOST_LIST=\"{host}\"\n\
             EXECD_SPOOL_DIR_LOCAL=/var/spool/sge\n\
             HOSTNAME_RESOLVING=true\n",
            root = self.paths.sge_root.display(),
            host = local_hostname,
        )
    }
}
