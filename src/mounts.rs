//! Declarative filesystem-mount reconciliation.
//!
//! The master ships each worker a full list of [`MountSpec`]s; the worker
//! diffs that list against the live OS mount table, mounts what is missing and
//! unmounts what is no longer wanted. Re-running with an unchanged list issues
//! no commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runner::CommandRunner;

/// Tri-state result of a probe or mount attempt, reported in NODE_STATUS as
/// `0` (never attempted), `1` (healthy) or `-1` (failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeStatus {
    #[default]
    Untried,
    Ok,
    Failed,
}

impl ProbeStatus {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ProbeStatus::Untried => "0",
            ProbeStatus::Ok => "1",
            ProbeStatus::Failed => "-1",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "0" => Some(ProbeStatus::Untried),
            "1" => Some(ProbeStatus::Ok),
            "-1" => Some(ProbeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeStatus::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Nfs,
    Bind,
    Other,
}

/// One entry of the declarative mount list supplied by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub label: String,
    pub local_path: String,
    pub fs_type: FsType,
    pub server: String,
    #[serde(default)]
    pub options: Option<String>,
}

impl MountSpec {
    pub fn nfs(
        label: impl Into<String>,
        local_path: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            local_path: local_path.into(),
            fs_type: FsType::Nfs,
            server: server.into(),
            options: None,
        }
    }

    /// Mount source; an NFS server given without an export path exports the
    /// same path it is mounted at.
    fn source(&self) -> String {
        if self.fs_type == FsType::Nfs && !self.server.contains(':') {
            format!("{}:{}", self.server, self.local_path)
        } else {
            self.server.clone()
        }
    }

    fn mount_command(&self) -> String {
        let opts = self
            .options
            .as_deref()
            .map(|o| format!("-o {} ", o))
            .unwrap_or_default();
        match self.fs_type {
            FsType::Nfs => format!("mount -t nfs {}{} '{}'", opts, self.source(), self.local_path),
            FsType::Bind => format!("mount --bind {} '{}'", self.server, self.local_path),
            FsType::Other => format!("mount {}{} '{}'", opts, self.source(), self.local_path),
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.label, self.local_path)
    }
}

/// Snapshot of the OS mount table (/proc/mounts).
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mount_points: Vec<String>,
}

impl MountTable {
    /// Parse /proc/mounts contents. The kernel escapes spaces in mount points
    /// as `\040`.
    pub fn parse(contents: &str) -> Self {
        let mount_points = contents
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|p| p.replace("\\040", " "))
            .collect();
        Self { mount_points }
    }

    pub async fn load() -> std::io::Result<Self> {
        let contents = tokio::fs::read_to_string("/proc/mounts").await?;
        Ok(Self::parse(&contents))
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mount_points.iter().any(|p| p == path)
    }
}

/// Result of one reconciliation pass, keyed by mount label.
#[derive(Debug, Default)]
pub struct MountOutcome {
    pub statuses: HashMap<String, ProbeStatus>,
    pub mounted: Vec<String>,
    pub unmounted: Vec<String>,
    pub failed: Vec<String>,
}

/// Applies the delta between the live mount table and a desired spec list.
pub struct MountReconciler {
    runner: Arc<dyn CommandRunner>,
    umount_attempts: u32,
    umount_delay: Duration,
}

impl MountReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            umount_attempts: 3,
            umount_delay: Duration::from_secs(2),
        }
    }

    pub fn with_umount_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.umount_attempts = attempts;
        self.umount_delay = delay;
        self
    }

    /// Mount every `desired` entry not already active and unmount every
    /// previously applied entry whose path left the desired list. Entries
    /// already present in `table` are not re-mounted.
    pub async fn reconcile(
        &self,
        table: &MountTable,
        previous: &[MountSpec],
        desired: &[MountSpec],
    ) -> MountOutcome {
        let mut outcome = MountOutcome::default();

        for spec in desired {
            if table.is_mounted(&spec.local_path) {
                tracing::debug!(mount = %spec, "Already mounted, skipping");
                outcome.statuses.insert(spec.label.clone(), ProbeStatus::Ok);
                continue;
            }
            let status = self.mount_one(spec).await;
            match status {
                ProbeStatus::Ok => outcome.mounted.push(spec.label.clone()),
                _ => outcome.failed.push(spec.label.clone()),
            }
            outcome.statuses.insert(spec.label.clone(), status);
        }

        for old in previous {
            if desired.iter().any(|d| d.local_path == old.local_path) {
                continue;
            }
            if !table.is_mounted(&old.local_path) {
                continue;
            }
            if self.unmount(&old.local_path).await {
                outcome.unmounted.push(old.label.clone());
            } else {
                outcome.failed.push(old.label.clone());
            }
        }

        outcome
    }

    async fn mount_one(&self, spec: &MountSpec) -> ProbeStatus {
        tracing::debug!(mount = %spec, server = %spec.server, "Mounting");
        if let Err(e) = self
            .runner
            .run(&format!("mkdir -p '{}'", spec.local_path))
            .await
        {
            tracing::error!(mount = %spec, error = %e, "Cannot create mount point");
            return ProbeStatus::Failed;
        }
        match self.runner.run(&spec.mount_command()).await {
            Ok(out) if out.success() => ProbeStatus::Ok,
            Ok(out) => {
                tracing::warn!(
                    mount = %spec,
                    exit_code = ?out.exit_code,
                    stderr = %out.stderr,
                    "Mount failed"
                );
                ProbeStatus::Failed
            }
            Err(e) => {
                tracing::error!(mount = %spec, error = %e, "Mount command did not run");
                ProbeStatus::Failed
            }
        }
    }

    /// Lazy force unmount, retried a bounded number of times. A hard failure
    /// is reported in status only; it never takes the worker down.
    async fn unmount(&self, path: &str) -> bool {
        for attempt in 1..=self.umount_attempts {
            match self.runner.run(&format!("umount -lf '{}'", path)).await {
                Ok(out) if out.success() => {
                    tracing::debug!(path, "Unmounted");
                    return true;
                }
                Ok(out) => {
                    tracing::debug!(
                        path,
                        attempt,
                        exit_code = ?out.exit_code,
                        "Unmount attempt failed"
                    );
                }
                Err(e) => {
                    tracing::debug!(path, attempt, error = %e, "Unmount command did not run");
                }
            }
            if attempt < self.umount_attempts {
                tokio::time::sleep(self.umount_delay).await;
            }
        }
        tracing::error!(path, "Giving up unmounting");
        false
    }

    /// Unmount everything in `applied`, used on worker shutdown.
    pub async fn unmount_all(&self, applied: &[MountSpec]) {
        for spec in applied {
            self.unmount(&spec.local_path).await;
        }
    }
}
