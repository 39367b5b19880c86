use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

fn default_exchange_port() -> u16 {
    50600
}

fn default_cluster_name() -> String {
    "gridpool".to_string()
}

fn default_poll_interval() -> u64 {
    10_000
}

/// Boot-time configuration bundle handed to a worker instance, the equivalent
/// of cloud "user data". Supplied by the provisioning layer; everything here
/// has a usable default except the master address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// Worker id used as the transport routing key. Defaults to the cloud
    /// instance id when absent.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// Address of the master (coordinating) node.
    pub master_ip: String,

    #[serde(default = "default_exchange_port")]
    pub exchange_port: u16,

    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Object-store bucket shared by the cluster.
    #[serde(default)]
    pub cluster_bucket: String,

    /// Additional NFS paths exported by the master, mounted verbatim.
    #[serde(default)]
    pub extra_nfs_mounts: Vec<String>,

    /// Supervisor loop interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub paths: ClusterPaths,
}

impl BootConfig {
    pub fn new(master_ip: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            master_ip: master_ip.into(),
            exchange_port: default_exchange_port(),
            cluster_name: default_cluster_name(),
            cluster_bucket: String::new(),
            extra_nfs_mounts: Vec::new(),
            poll_interval_ms: default_poll_interval(),
            paths: ClusterPaths::default(),
        }
    }

    /// Load the bundle from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GridError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// gRPC endpoint of the message exchange hosted on the master.
    pub fn exchange_endpoint(&self) -> String {
        format!("http://{}:{}", self.master_ip, self.exchange_port)
    }
}

/// Well-known filesystem locations shared across the cluster. Kept in the
/// boot bundle so tests and non-standard images can redirect them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPaths {
    /// SGE installation root, exported by the master over NFS.
    pub sge_root: PathBuf,
    /// Slurm directory on the cluster-wide transient NFS.
    pub slurm_shared_dir: PathBuf,
    /// Location the slurm-llnl package insists on for its config.
    pub slurm_conf_local: PathBuf,
    pub slurm_root_tmp: PathBuf,
    pub slurmd_pid_file: PathBuf,
    pub slurmd_log_file: PathBuf,
    pub munge_key_local: PathBuf,
    pub authorized_keys: PathBuf,
    /// Master's /etc/hosts copy published for SYNC_ETC_HOSTS.
    pub etc_hosts_sync: PathBuf,
    /// Local working directory for downloaded artifacts.
    pub home: PathBuf,
    /// Root of the filesystem-backed object store (shared over NFS).
    pub bucket_store: PathBuf,
}

impl Default for ClusterPaths {
    fn default() -> Self {
        Self {
            sge_root: PathBuf::from("/opt/sge"),
            slurm_shared_dir: PathBuf::from("/mnt/transient_nfs/slurm"),
            slurm_conf_local: PathBuf::from("/etc/slurm-llnl/slurm.conf"),
            slurm_root_tmp: PathBuf::from("/tmp/slurm"),
            slurmd_pid_file: PathBuf::from("/var/run/slurmd.pid"),
            slurmd_log_file: PathBuf::from("/var/log/slurm-llnl/slurmd.log"),
            munge_key_local: PathBuf::from("/etc/munge/munge.key"),
            authorized_keys: PathBuf::from("/root/.ssh/authorized_keys"),
            etc_hosts_sync: PathBuf::from("/mnt/transient_nfs/etc_hosts"),
            home: PathBuf::from("/opt/gridpool"),
            bucket_store: PathBuf::from("/mnt/transient_nfs/bucket"),
        }
    }
}

impl ClusterPaths {
    /// Authoritative slurm.conf on the shared filesystem.
    pub fn slurm_conf_nfs(&self) -> PathBuf {
        self.slurm_shared_dir.join("slurm.conf")
    }

    /// Cluster-wide lock taken around slurm.conf edits and slurmd starts.
    /// Must resolve to the same file on the master and every worker.
    pub fn slurm_lock_file(&self) -> PathBuf {
        self.slurm_shared_dir.join("slurm.lockfile")
    }

    pub fn munge_key_nfs(&self) -> PathBuf {
        self.slurm_shared_dir.join("munge.key")
    }
}

/// Provider metadata snapshot announced in the ALIVE message. Gathered once at
/// boot; cloud-specific fields fall back to empty strings when the provider
/// does not expose them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub private_ip: String,
    pub public_ip: String,
    pub zone: String,
    pub instance_type: String,
    pub image_id: String,
    pub hostname: String,
    pub num_cpus: u32,
    /// Total memory in kB, as reported by /proc/meminfo.
    pub total_memory_kb: u64,
    pub os_hostname: String,
}

impl InstanceInfo {
    /// Best-effort local detection from /proc and /etc/hostname.
    pub fn detect(instance_id: impl Into<String>) -> Self {
        let num_cpus = std::fs::read_to_string("/proc/cpuinfo")
            .map(|s| s.lines().filter(|l| l.starts_with("processor")).count() as u32)
            .unwrap_or(1);
        let total_memory_kb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| {
                s.lines()
                    .find(|l| l.starts_with("MemTotal"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(0);
        let os_hostname = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            instance_id: instance_id.into(),
            private_ip: String::new(),
            public_ip: String::new(),
            zone: String::new(),
            instance_type: String::new(),
            image_id: String::new(),
            hostname: os_hostname.clone(),
            num_cpus,
            total_memory_kb,
            os_hostname,
        }
    }

    /// Fully qualified name used for the host certificate scan.
    pub fn fqdn(&self) -> &str {
        if self.hostname.is_empty() {
            &self.os_hostname
        } else {
            &self.hostname
        }
    }
}
