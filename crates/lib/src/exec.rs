//! Shell execution for the `bash` tool: run a command line through the platform shell with a timeout.
//! The command is trusted input; there is no allowlist or sandbox.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured output of a finished command (exit status is not reported to the model).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Spawn(#[from] std::io::Error),
}

/// Runs a shell command line. The default implementation is [`ShellExecutor`]; tests substitute fakes.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError>;
}

/// Runs commands with `sh -c` (`cmd /C` on Windows). The child is killed when the timeout elapses.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(command: &str) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ExecError> {
        log::debug!("exec: running {:?} (timeout {:?})", command, timeout);
        let child = Self::command(command).spawn()?;
        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => return Err(ExecError::TimedOut(timeout)),
        };
        if !output.status.success() {
            log::debug!("exec: {:?} exited with {}", command, output.status);
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
