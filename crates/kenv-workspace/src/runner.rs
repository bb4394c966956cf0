//! Subprocess boundary for the infrastructure tool

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, warn};

use kenv_common::Error;

/// One command to run inside a workspace directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable to run
    pub program: String,
    /// Arguments, in order
    pub args: Vec<String>,
    /// Working directory
    pub current_dir: PathBuf,
    /// Short label for logs and errors (e.g., "terraform apply")
    pub description: String,
}

/// Captured output of a successful command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Runs commands and reports non-zero exits as `Error::Execution`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing stdout and stderr
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error>;
}

/// Real runner on `tokio::process`.
///
/// The child inherits this process's environment, which is how cloud
/// credentials reach the tool.
#[derive(Clone, Debug, Default)]
pub struct TokioCommandRunner {
    timeout: Option<Duration>,
}

impl TokioCommandRunner {
    /// Runner without a deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner that kills commands still running after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error> {
        debug!(command = %spec.description, dir = %spec.current_dir.display(), "running");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.current_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    warn!(command = %spec.description, ?limit, "command timed out");
                    Error::timeout(&spec.description, limit)
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| {
            Error::execution(&spec.description, format!("failed to execute {}: {}", spec.program, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            warn!(command = %spec.description, status = %output.status, "command failed");
            Err(Error::execution_with_stderr(
                &spec.description,
                format!("terraform command failed: {}", output.status),
                stderr,
            ))
        }
    }
}
