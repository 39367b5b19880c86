//! Batch-scheduler ("job manager") integration.
//!
//! Two backends bring nodes in and out of the scheduling pool:
//!
//! - [`slurm::SlurmJobManager`] regenerates the authoritative `slurm.conf`
//!   from the known-good worker list and reloads the cluster via
//!   `scontrol reconfigure`.
//! - [`sge::SgeJobManager`] issues direct per-node `qconf`/`qmod` commands.
//!
//! The worker side of the handshake (daemon bootstrap plus the pid-file
//! health probe) lives in [`bootstrap`].

pub mod bootstrap;
pub mod sge;
pub mod slurm;

use std::fmt;

use tonic::async_trait;

use crate::error::{GridError, Result};
use crate::runner::{CommandOutput, CommandRunner};

pub use bootstrap::{SgeBootstrap, SlurmdBootstrap};
pub use sge::SgeJobManager;
pub use slurm::SlurmJobManager;

/// Default scheduler queue/partition name.
pub const DEFAULT_QUEUE: &str = "main";

/// Scheduler-facing description of a pool member. The alias is assigned by
/// the master and is distinct from the cloud instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescription {
    pub alias: String,
    pub private_ip: String,
    pub num_cpus: u32,
    pub total_memory_kb: u64,
}

/// Target state for [`JobManager::disable_node`].
///
/// `Drain` lets running jobs finish before the scheduler takes the node
/// offline. `Down` evicts immediately: running and suspended jobs on the node
/// are terminated and rescheduled elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisableState {
    #[default]
    Drain,
    Down,
}

impl fmt::Display for DisableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableState::Drain => f.write_str("DRAIN"),
            DisableState::Down => f.write_str("DOWN"),
        }
    }
}

/// Capability set shared by the scheduler backends. Every topology mutation
/// surfaces command failures as errors; nothing is silently swallowed.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Register `node` with the scheduler so it can receive jobs.
    async fn add_node(&self, node: &NodeDescription) -> Result<()>;

    /// Remove `node` from the pool. Drains first; removing a node with jobs
    /// still running without draining is a correctness bug, not a supported
    /// path.
    async fn remove_node(&self, node: &NodeDescription) -> Result<()>;

    async fn enable_node(&self, alias: &str) -> Result<()>;

    async fn disable_node(&self, alias: &str, reason: &str, state: DisableState) -> Result<()>;

    /// Aliases of nodes currently executing zero jobs.
    async fn idle_nodes(&self) -> Result<Vec<String>>;

    async fn suspend_queue(&self, queue: &str) -> Result<()>;

    async fn unsuspend_queue(&self, queue: &str) -> Result<()>;
}

/// Bounded automatic-restart accounting for a supervised daemon. Reset by any
/// healthy probe; once exhausted, no further restarts are attempted and the
/// daemon stays failed (the worker itself keeps running).
#[derive(Debug, Clone)]
pub struct RestartBudget {
    attempts: u32,
    max: u32,
}

impl RestartBudget {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    pub fn record_healthy(&mut self) {
        self.attempts = 0;
    }

    /// Claim one restart attempt. Returns `false` once the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        if self.attempts < self.max {
            self.attempts += 1;
            true
        } else {
            false
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max
    }
}

/// Run `cmd` and map a non-zero exit onto [`GridError::CommandFailed`].
pub(crate) async fn run_checked(runner: &dyn CommandRunner, cmd: &str) -> Result<CommandOutput> {
    let out = runner.run(cmd).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(GridError::CommandFailed {
            command: cmd.to_string(),
            code: out.exit_code,
            stderr: out.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_allows_max_attempts_then_stops() {
        let mut budget = RestartBudget::new(3);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(budget.exhausted());
        assert_eq!(budget.attempts(), 3);
    }

    #[test]
    fn healthy_probe_resets_the_budget() {
        let mut budget = RestartBudget::new(2);
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        budget.record_healthy();
        assert!(!budget.exhausted());
        assert!(budget.try_consume());
    }

    #[test]
    fn disable_state_wire_tokens() {
        assert_eq!(DisableState::Drain.to_string(), "DRAIN");
        assert_eq!(DisableState::Down.to_string(), "DOWN");
        assert_eq!(DisableState::default(), DisableState::Drain);
    }
}
