//! Folds protocol events into one response: running text plus at most one tool invocation.

use futures_util::Stream;

use super::decoder::{EventDecoder, ProtocolEvent};
use crate::llm::ApiError;

/// Mutable state of the response being streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedResponse {
    pub text: String,
    pub tool_name: Option<String>,
    pub tool_args_raw: String,
}

/// A tool the model asked for, with its parsed argument object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub args: serde_json::Value,
}

/// Final state of one response, produced exactly once per stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedResponse {
    pub text: String,
    pub tool_name: Option<String>,
    /// `None` when no tool was requested or its arguments did not parse.
    pub tool_args: Option<serde_json::Value>,
}

impl CompletedResponse {
    /// The invocation to dispatch, if both a tool name and parsed arguments are present.
    pub fn invocation(&self) -> Option<ToolInvocation> {
        match (&self.tool_name, &self.tool_args) {
            (Some(name), Some(args)) => Some(ToolInvocation {
                name: name.clone(),
                args: args.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    response: AccumulatedResponse,
    ended: bool,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response(&self) -> &AccumulatedResponse {
        &self.response
    }

    /// True once a [`ProtocolEvent::StreamEnd`] has been applied.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Apply one event. Returns the running text when the event was a text delta.
    /// A `ToolUseStart` replaces the tool name and clears the argument buffer, so a later
    /// tool block never inherits fragments from an earlier one.
    pub fn apply(&mut self, event: ProtocolEvent) -> Option<&str> {
        match event {
            ProtocolEvent::TextDelta(delta) => {
                self.response.text.push_str(&delta);
                return Some(&self.response.text);
            }
            ProtocolEvent::ToolUseStart(name) => {
                if let Some(previous) = self.response.tool_name.replace(name) {
                    log::warn!(
                        "stream: second tool_use block replaces {} (only the last tool runs)",
                        previous
                    );
                }
                // Arguments belong to the block that is now current.
                self.response.tool_args_raw.clear();
            }
            ProtocolEvent::ToolInputDelta(fragment) => {
                self.response.tool_args_raw.push_str(&fragment);
            }
            ProtocolEvent::StreamEnd => self.ended = true,
        }
        None
    }

    /// Final flush: parse the argument buffer if a tool was named.
    pub fn finish(self) -> CompletedResponse {
        let AccumulatedResponse {
            text,
            tool_name,
            tool_args_raw,
        } = self.response;
        let tool_args = tool_name.as_ref().and_then(|name| {
            match serde_json::from_str::<serde_json::Value>(&tool_args_raw) {
                Ok(args) => Some(args),
                Err(e) => {
                    log::warn!("stream: dropping {} call, arguments did not parse: {}", name, e);
                    None
                }
            }
        });
        CompletedResponse {
            text,
            tool_name,
            tool_args,
        }
    }
}

/// Drain the decoder into a [`CompletedResponse`], calling `on_update` with the running text after every text delta.
pub async fn accumulate<S>(
    decoder: &mut EventDecoder<S>,
    on_update: &mut (dyn FnMut(&str) + Send),
) -> Result<CompletedResponse, ApiError>
where
    S: Stream<Item = Result<Vec<u8>, ApiError>> + Unpin,
{
    let mut acc = ResponseAccumulator::new();
    while let Some(event) = decoder.next_event().await? {
        if let Some(text) = acc.apply(event) {
            on_update(text);
        }
        if acc.is_ended() {
            break;
        }
    }
    Ok(acc.finish())
}
