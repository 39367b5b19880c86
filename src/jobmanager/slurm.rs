use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::async_trait;

use crate::config::ClusterPaths;
use crate::error::Result;
use crate::jobmanager::{run_checked, DisableState, JobManager, NodeDescription};
use crate::runner::CommandRunner;

/// Facts about the master node emitted into `slurm.conf`.
#[derive(Debug, Clone)]
pub struct MasterInfo {
    pub hostname: String,
    pub num_cpus: u32,
    pub total_memory_kb: u64,
}

/// Slurm backend.
///
/// Strategy: every topology mutation regenerates the authoritative
/// `slurm.conf` on the cluster NFS from the current worker registry, then
/// issues `scontrol reconfigure` so all daemons pick it up. Per-node state
/// changes (drain, resume) go through `scontrol update` directly.
pub struct SlurmJobManager {
    runner: Arc<dyn CommandRunner>,
    paths: ClusterPaths,
    master: MasterInfo,
    nodes: RwLock<Vec<NodeDescription>>,
}

impl SlurmJobManager {
    pub fn new(runner: Arc<dyn CommandRunner>, paths: ClusterPaths, master: MasterInfo) -> Self {
        Self {
            runner,
            paths,
            master,
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Memory in MB for RealMemory, never below 1.
    fn real_memory_mb(total_memory_kb: u64) -> u64 {
        (total_memory_kb / 1024).max(1)
    }

    /// Render `slurm.conf` for the master plus the given workers.
    pub fn render_conf(&self, nodes: &[NodeDescription]) -> String {
        let mut worker_lines = String::new();
        let mut worker_names = String::new();
        for node in nodes {
            worker_lines.push_str(&format!(
                "NodeName={} NodeAddr={} CPUs={} RealMemory={} Weight=5 State=UNKNOWN\n",
                node.alias,
                node.private_ip,
                node.num_cpus,
                Self::real_memory_mb(node.total_memory_kb),
            ));
            worker_names.push_str(&format!(",{}", node.alias));
        }

        format!(
            "ClusterName=gridpool\n\
             ControlMachine={master}\n\
             SlurmdSpoolDir={spool}\n\
             SlurmdPidFile={pid}\n\
             ReturnToService=2\n\
             SchedulerType=sched/backfill\n\
             SelectType=select/cons_res\n\
             SelectTypeParameters=CR_CPU\n\
             NodeName=master NodeAddr={master} CPUs={cpus} RealMemory={mem} State=UNKNOWN\n\
             {workers}\
             PartitionName=main Nodes=master{names} Default=YES MaxTime=INFINITE State=UP\n",
            master = self.master.hostname,
            spool = self.paths.slurm_root_tmp.display(),
            pid = self.paths.slurmd_pid_file.display(),
            // Reserve one CPU on the master for its own services.
            cpus = self.master.num_cpus.saturating_sub(1).max(1),
            mem = Self::real_memory_mb(self.master.total_memory_kb),
            workers = worker_lines,
            names = worker_names,
        )
    }

    /// Rewrite the shared `slurm.conf` under the cluster-wide lock and tell
    /// all daemons to reload it.
    async fn reconfigure(&self) -> Result<()> {
        let nodes = self.nodes.read().await;
        tracing::debug!(workers = nodes.len(), "Reconfiguring Slurm cluster");
        let conf = self.render_conf(nodes.as_slice());
        drop(nodes);

        tokio::fs::create_dir_all(&self.paths.slurm_shared_dir).await?;
        let conf_path = self.paths.slurm_conf_nfs();
        let tmp_path = conf_path.with_extension("conf.new");
        tokio::fs::write(&tmp_path, conf).await?;
        run_checked(
            self.runner.as_ref(),
            &format!(
                "flock {} mv {} {}",
                self.paths.slurm_lock_file().display(),
                tmp_path.display(),
                conf_path.display()
            ),
        )
        .await?;
        run_checked(self.runner.as_ref(), "/usr/bin/scontrol reconfigure").await?;
        Ok(())
    }

    async fn scontrol_update(&self, update: &str) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            &format!("/usr/bin/scontrol update {}", update),
        )
        .await
        .map(|_| ())
    }

    /// Registered workers, for inspection.
    pub async fn nodes(&self) -> Vec<NodeDescription> {
        self.nodes.read().await.clone()
    }
}

#[async_trait]
impl JobManager for SlurmJobManager {
    async fn add_node(&self, node: &NodeDescription) -> Result<()> {
        tracing::debug!(alias = %node.alias, "Adding node to Slurm cluster");
        {
            let mut nodes = self.nodes.write().await;
            nodes.retain(|n| n.alias != node.alias);
            nodes.push(node.clone());
        }
        self.reconfigure().await
    }

    async fn remove_node(&self, node: &NodeDescription) -> Result<()> {
        tracing::debug!(alias = %node.alias, "Removing node from Slurm cluster");
        self.disable_node(&node.alias, "gridpool-removing", DisableState::Drain)
            .await?;
        self.disable_node(&node.alias, "gridpool-removed", DisableState::Down)
            .await?;
        {
            let mut nodes = self.nodes.write().await;
            nodes.retain(|n| n.alias != node.alias);
        }
        self.reconfigure().await
    }

    async fn enable_node(&self, alias: &str) -> Result<()> {
        self.scontrol_update(&format!("NodeName={} State=RESUME", alias))
            .await
    }

    async fn disable_node(&self, alias: &str, reason: &str, state: DisableState) -> Result<()> {
        self.scontrol_update(&format!(
            "NodeName={} Reason=\"{}\" State={}",
            alias, reason, state
        ))
        .await
    }

    async fn idle_nodes(&self) -> Result<Vec<String>> {
        let out = run_checked(self.runner.as_ref(), "sinfo -o '%T %n' -h").await?;
        let idle = out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let state = parts.next()?;
                let name = parts.next()?;
                // Drained/starred states still count; "idle*" means unreachable
                // but not allocated.
                if state.starts_with("idle") || state.starts_with("down") {
                    Some(name.to_string())
                } else {
                    None
                }
            })
            .collect();
        Ok(idle)
    }

    async fn suspend_queue(&self, queue: &str) -> Result<()> {
        tracing::debug!(partition = queue, "Suspending Slurm partition");
        self.scontrol_update(&format!("PartitionName={} State=DOWN", queue))
            .await
    }

    async fn unsuspend_queue(&self, queue: &str) -> Result<()> {
        tracing::debug!(partition = queue, "Unsuspending Slurm partition");
        self.scontrol_update(&format!("PartitionName={} State=UP", queue))
            .await
    }
}
