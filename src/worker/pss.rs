use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::BootConfig;
use crate::runner::CommandRunner;
use crate::storage::ObjectStore;

/// Name under which the worker hook script lives in the cluster bucket.
const SCRIPT_NAME: &str = "worker_post_start_script";

/// Health of a sibling service, as seen by the gating check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub healthy: bool,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, healthy: bool) -> Self {
        Self {
            name: name.into(),
            healthy,
        }
    }
}

/// Result of a [`PostStartHook::try_start`] gating check.
#[derive(Debug)]
pub enum StartOutcome {
    /// The hook task was spawned; the handle resolves when it completes.
    Started(JoinHandle<()>),
    NotYetReady,
}

/// Deployment hook that runs exactly once, only after every sibling service
/// reports healthy.
///
/// The script is fetched from the cluster bucket; after a run the hook pushes
/// the script back for reuse by future instances and removes itself from the
/// active service set so it plays no further part in health aggregation. The
/// script may take arbitrarily long, so it runs on its own task and never
/// blocks the supervisor's heartbeats.
pub struct PostStartHook {
    bucket: String,
    home: PathBuf,
    store: Arc<dyn ObjectStore>,
    runner: Arc<dyn CommandRunner>,
    already_ran: AtomicBool,
    active: AtomicBool,
}

impl PostStartHook {
    pub fn new(
        config: &BootConfig,
        store: Arc<dyn ObjectStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bucket: config.cluster_bucket.clone(),
            home: config.paths.home.clone(),
            store,
            runner,
            already_ran: AtomicBool::new(false),
            active: AtomicBool::new(true),
        })
    }

    /// Whether the hook still participates in health aggregation.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn has_run(&self) -> bool {
        self.already_ran.load(Ordering::Acquire)
    }

    /// Start the hook if every sibling is healthy and it has not run before.
    /// The one-shot latch flips atomically, so repeated readiness checks can
    /// never spawn the task twice.
    pub fn try_start(self: Arc<Self>, siblings: &[ServiceStatus]) -> StartOutcome {
        if let Some(blocked) = siblings.iter().find(|s| !s.healthy) {
            tracing::debug!(waiting_on = %blocked.name, "Post-start hook prerequisites not met");
            return StartOutcome::NotYetReady;
        }
        if self
            .already_ran
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StartOutcome::NotYetReady;
        }
        StartOutcome::Started(tokio::spawn(async move { self.run().await }))
    }

    async fn run(self: Arc<Self>) {
        tracing::info!(bucket = %self.bucket, "Running post-start hook");
        if let Err(e) = tokio::fs::create_dir_all(&self.home).await {
            tracing::warn!(error = %e, "Cannot create hook working directory");
        }
        let local = self.home.join(SCRIPT_NAME);

        let obtained = self.store.get(&self.bucket, SCRIPT_NAME, &local).await;
        if obtained && file_non_empty(&local).await {
            tracing::info!(
                script = %local.display(),
                "Post-start script found; running it now (this may take a while)"
            );
            self.execute(&local).await;
            // Persist the script for future worker instances.
            if self.store.put(&self.bucket, SCRIPT_NAME, &local).await {
                tracing::debug!(bucket = %self.bucket, "Post-start script saved back to bucket");
            }
        } else {
            tracing::debug!("No post-start script provided or obtained; continuing");
        }

        // Self-removal from the active service list.
        self.active.store(false, Ordering::Release);
        tracing::info!("Post-start hook done");
    }

    async fn execute(&self, script: &std::path::Path) {
        let cmd = format!(
            "chmod 755 '{script}' && cd '{home}' && './{name}'",
            script = script.display(),
            home = self.home.display(),
            name = SCRIPT_NAME,
        );
        match self.runner.run(&cmd).await {
            Ok(out) if out.success() => tracing::info!("Post-start script completed"),
            Ok(out) => tracing::error!(
                exit_code = ?out.exit_code,
                stderr = %out.stderr,
                "Post-start script failed"
            ),
            Err(e) => tracing::error!(error = %e, "Post-start script did not run"),
        }
    }
}

async fn file_non_empty(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}
