//! Worker-side lifecycle coordination.
//!
//! A freshly booted instance is driven from "just started" to "accepting
//! jobs" by control messages from the master:
//!
//! 1. [`Supervisor`] connects to the exchange and announces ALIVE
//! 2. MASTER_PUBKEY installs the master's credential, the worker replies with
//!    its host certificate
//! 3. MOUNT reconciles the shared filesystems
//! 4. START_SGE / START_SLURMD bootstraps the scheduler daemon; on success the
//!    worker reports NODE_READY and runs the gated post-start hook
//!
//! # Components
//!
//! - [`WorkerState`]: the boot state machine's control variable
//! - [`manager::WorkerManager`]: mounts, credentials and daemon bootstrap
//! - [`monitor::Supervisor`]: the always-on poll/dispatch loop
//! - [`pss::PostStartHook`]: run-exactly-once post-start hook

pub mod manager;
pub mod monitor;
pub mod pss;

use std::fmt;
use std::str::FromStr;

pub use manager::WorkerManager;
pub use monitor::Supervisor;
pub use pss::{PostStartHook, ServiceStatus, StartOutcome};

/// Lifecycle state of a worker process. Mutated only by the supervisor loop.
///
/// `Error` is deliberately soft: a worker that failed scheduler bootstrap
/// keeps answering status, mount and reboot messages so the master can
/// observe and react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Waking,
    Starting,
    AwaitingSchedulerBootstrap,
    Ready,
    ShuttingDown,
    Error,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Waking => "Waking",
            WorkerState::Starting => "Starting",
            WorkerState::AwaitingSchedulerBootstrap => "AwaitingSchedulerBootstrap",
            WorkerState::Ready => "Ready",
            WorkerState::ShuttingDown => "ShuttingDown",
            WorkerState::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Waking" => Ok(WorkerState::Waking),
            "Starting" => Ok(WorkerState::Starting),
            "AwaitingSchedulerBootstrap" => Ok(WorkerState::AwaitingSchedulerBootstrap),
            "Ready" => Ok(WorkerState::Ready),
            "ShuttingDown" => Ok(WorkerState::ShuttingDown),
            "Error" => Ok(WorkerState::Error),
            other => Err(format!("unknown worker state `{}`", other)),
        }
    }
}
