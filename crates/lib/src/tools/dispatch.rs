//! Tool dispatch: map a completed tool invocation onto a local action.

use std::sync::Arc;
use std::time::Duration;

use super::capture::{prepare_screenshot, AttachedImage, ScreenCapture};
use crate::exec::{CommandExecutor, ExecError};

/// Stderr reported when a `bash` command exceeds its timeout.
pub const TIMEOUT_MESSAGE: &str = "Command timed out";

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool call this client knows how to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Bash { command: String },
    Computer(ComputerAction),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputerAction {
    Screenshot,
    /// Clicks, typing and other actions are declared to the model but not performed.
    Unsupported(String),
}

impl ToolCall {
    /// Interpret `(name, args)`. Unknown tools and malformed arguments give `None`.
    pub fn parse(name: &str, args: &serde_json::Value) -> Option<Self> {
        match name {
            "bash" => args
                .get("command")
                .and_then(|c| c.as_str())
                .map(|command| ToolCall::Bash {
                    command: command.to_string(),
                }),
            "computer" => {
                let action = args
                    .get("action")
                    .or_else(|| args.pointer("/input/action"))
                    .and_then(|a| a.as_str())?;
                Some(ToolCall::Computer(match action {
                    "screenshot" => ComputerAction::Screenshot,
                    other => ComputerAction::Unsupported(other.to_string()),
                }))
            }
            _ => None,
        }
    }
}

/// Result of a `bash` call; failures are folded into `stderr`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Text shown to the user: stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// What dispatching produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Command output worth reporting (stdout or stderr non-empty).
    Command(CommandResult),
    /// Screenshot ready for the next request.
    Screenshot(AttachedImage),
    /// Unknown tool, malformed args, empty output, or a best-effort action that failed.
    Nothing,
}

/// Executes tool calls through injected command and capture capabilities.
#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn CommandExecutor>,
    capture: Arc<dyn ScreenCapture>,
    command_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn CommandExecutor>, capture: Arc<dyn ScreenCapture>) -> Self {
        Self {
            executor,
            capture,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Dispatch one invocation. Never fails: errors become command output or are logged and dropped.
    pub async fn dispatch(&self, name: &str, args: &serde_json::Value) -> DispatchOutcome {
        let Some(call) = ToolCall::parse(name, args) else {
            log::debug!("tools: ignoring {} call with args {}", name, args);
            return DispatchOutcome::Nothing;
        };
        match call {
            ToolCall::Bash { command } => {
                let result = self.run_command(&command).await;
                if result.is_empty() {
                    DispatchOutcome::Nothing
                } else {
                    DispatchOutcome::Command(result)
                }
            }
            ToolCall::Computer(ComputerAction::Screenshot) => match self.screenshot().await {
                Ok(image) => DispatchOutcome::Screenshot(image),
                Err(e) => {
                    log::warn!("tools: screenshot failed: {}", e);
                    DispatchOutcome::Nothing
                }
            },
            ToolCall::Computer(ComputerAction::Unsupported(action)) => {
                log::info!("tools: computer action {:?} is not supported", action);
                DispatchOutcome::Nothing
            }
        }
    }

    /// Run a shell command; timeout and spawn failures are reported through stderr.
    pub async fn run_command(&self, command: &str) -> CommandResult {
        log::info!("tools: bash {:?}", command);
        match self.executor.execute(command, self.command_timeout).await {
            Ok(out) => CommandResult {
                stdout: out.stdout,
                stderr: out.stderr,
            },
            Err(ExecError::TimedOut(_)) => CommandResult {
                stdout: String::new(),
                stderr: TIMEOUT_MESSAGE.to_string(),
            },
            Err(e) => CommandResult {
                stdout: String::new(),
                stderr: e.to_string(),
            },
        }
    }

    async fn screenshot(&self) -> Result<AttachedImage, super::capture::CaptureError> {
        let image = self.capture.capture().await?;
        tokio::task::spawn_blocking(move || prepare_screenshot(&image))
            .await
            .map_err(|e| super::capture::CaptureError::Command(e.to_string()))?
    }
}
