use std::process::Stdio;

use tokio::process::Command;
use tonic::async_trait;

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convenience constructor for a zero-exit result.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Convenience constructor for a failed result.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Seam for executing external tooling (mount, scheduler and system commands).
///
/// Mount reconciliation and the job-manager backends shell out to OS tools;
/// routing every spawn through this trait lets tests substitute scripted
/// results without touching the system.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str) -> std::io::Result<CommandOutput>;
}

/// Runs commands through `sh -c`, capturing stdout/stderr.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> std::io::Result<CommandOutput> {
        tracing::debug!(command = cmd, "Running command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        };

        if !result.success() {
            tracing::debug!(
                command = cmd,
                exit_code = ?result.exit_code,
                stderr = %result.stderr,
                "Command returned non-zero"
            );
        }
        Ok(result)
    }
}
