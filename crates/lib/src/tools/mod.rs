//! Tool layer: dispatcher for the `bash` and `computer` tools plus screen capture.

mod capture;
mod dispatch;

pub use capture::{
    default_screenshot_command, prepare_screenshot, AttachedImage, CaptureError, CommandCapture,
    ScreenCapture, DEFAULT_CAPTURE_TIMEOUT,
};
pub use dispatch::{
    CommandResult, ComputerAction, DispatchOutcome, ToolCall, ToolDispatcher,
    DEFAULT_COMMAND_TIMEOUT, TIMEOUT_MESSAGE,
};
