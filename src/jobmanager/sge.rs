use std::path::PathBuf;
use std::sync::Arc;

use tonic::async_trait;

use crate::error::Result;
use crate::jobmanager::{run_checked, DisableState, JobManager, NodeDescription};
use crate::runner::CommandRunner;

/// SGE backend.
///
/// Strategy: direct per-node scheduler commands. Hosts are registered as
/// administrative and execution hosts with `qconf`; enable/disable goes
/// through `qmod` queue-instance states. Starting `sge_execd` on a registered
/// host implies queue membership, so there is no separate pool-join step.
pub struct SgeJobManager {
    runner: Arc<dyn CommandRunner>,
    sge_root: PathBuf,
}

impl SgeJobManager {
    pub fn new(runner: Arc<dyn CommandRunner>, sge_root: PathBuf) -> Self {
        Self { runner, sge_root }
    }

    /// Wrap an SGE binary invocation with the environment the tools require.
    fn sge_cmd(&self, args: &str) -> String {
        let root = self.sge_root.display();
        format!(
            "export SGE_ROOT={root}; . $SGE_ROOT/default/common/settings.sh; \
             {root}/bin/lx24-amd64/{args}"
        )
    }

    /// Minimal execution-host description fed to `qconf -Ae`.
    fn exec_host_conf(alias: &str) -> String {
        format!(
            "hostname {alias}\n\
             load_scaling NONE\n\
             complex_values NONE\n\
             user_lists NONE\n\
             xuser_lists NONE\n\
             projects NONE\n\
             xprojects NONE\n\
             usage_scaling NONE\n\
             report_variables NONE\n"
        )
    }
}

#[async_trait]
impl JobManager for SgeJobManager {
    async fn add_node(&self, node: &NodeDescription) -> Result<()> {
        tracing::debug!(alias = %node.alias, "Registering SGE host");
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qconf -ah {}", node.alias)),
        )
        .await?;

        let conf_path = std::env::temp_dir().join(format!("sge_host_{}.conf", node.alias));
        tokio::fs::write(&conf_path, Self::exec_host_conf(&node.alias)).await?;
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qconf -Ae {}", conf_path.display())),
        )
        .await?;
        Ok(())
    }

    async fn remove_node(&self, node: &NodeDescription) -> Result<()> {
        tracing::debug!(alias = %node.alias, "Deregistering SGE host");
        self.disable_node(&node.alias, "gridpool-removing", DisableState::Drain)
            .await?;
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qconf -de {}", node.alias)),
        )
        .await?;
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qconf -dh {}", node.alias)),
        )
        .await?;
        Ok(())
    }

    async fn enable_node(&self, alias: &str) -> Result<()> {
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qmod -e '*@{}'", alias)),
        )
        .await
        .map(|_| ())
    }

    async fn disable_node(&self, alias: &str, reason: &str, state: DisableState) -> Result<()> {
        // SGE has no reason field; record it here instead.
        tracing::info!(alias, reason, state = %state, "Disabling SGE host");
        let flag = match state {
            // Disabled queue instances accept no new jobs; running ones finish.
            DisableState::Drain => "-d",
            // Forced disable also suspends what is running.
            DisableState::Down => "-f -d",
        };
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qmod {} '*@{}'", flag, alias)),
        )
        .await
        .map(|_| ())
    }

    async fn idle_nodes(&self) -> Result<Vec<String>> {
        let out = run_checked(self.runner.as_ref(), &self.sge_cmd("qstat -f")).await?;
        // Queue-instance lines look like:
        //   all.q@w1   BIP   0/0/4   0.01   lx24-amd64
        // where slots are reserved/used/total.
        let idle = out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let queue_instance = parts.next()?;
                let (_, host) = queue_instance.split_once('@')?;
                let slots = parts.nth(1)?;
                let used: u32 = slots.split('/').nth(1)?.parse().ok()?;
                if used == 0 {
                    Some(host.to_string())
                } else {
                    None
                }
            })
            .collect();
        Ok(idle)
    }

    async fn suspend_queue(&self, queue: &str) -> Result<()> {
        tracing::debug!(queue, "Suspending SGE queue");
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qmod -sq {}", queue)),
        )
        .await
        .map(|_| ())
    }

    async fn unsuspend_queue(&self, queue: &str) -> Result<()> {
        tracing::debug!(queue, "Unsuspending SGE queue");
        run_checked(
            self.runner.as_ref(),
            &self.sge_cmd(&format!("qmod -usq {}", queue)),
        )
        .await
        .map(|_| ())
    }
}
