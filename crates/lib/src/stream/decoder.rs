//! SSE frame decoding: `data: <json>` lines in, [`ProtocolEvent`]s out.

use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::llm::ApiError;

/// Payload that terminates the stream without further reads.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// One typed event decoded from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    TextDelta(String),
    ToolUseStart(String),
    ToolInputDelta(String),
    StreamEnd,
}

/// What a single line contributes to the event sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Event(ProtocolEvent),
    /// Not a data line, or a frame we do not act on.
    Skip,
    /// Sentinel seen; stop reading.
    Done,
    /// Server reported an error inside the stream.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    content_block: Option<RawContentBlock>,
    delta: Option<RawDelta>,
    error: Option<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawContentBlock {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDelta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    message: Option<String>,
}

/// Decode one line of the response body.
pub fn decode_line(line: &str) -> LineOutcome {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skip;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    match serde_json::from_str::<RawFrame>(payload) {
        Ok(frame) => decode_frame(frame),
        Err(e) => {
            log::warn!("stream: skipping malformed frame: {}", e);
            LineOutcome::Skip
        }
    }
}

fn decode_frame(frame: RawFrame) -> LineOutcome {
    let Some(kind) = frame.kind.as_deref() else {
        return LineOutcome::Skip;
    };
    match kind {
        "content_block_start" => match frame.content_block {
            Some(block) if block.kind.as_deref() == Some("tool_use") => match block.name {
                Some(name) => LineOutcome::Event(ProtocolEvent::ToolUseStart(name)),
                None => LineOutcome::Skip,
            },
            _ => LineOutcome::Skip,
        },
        "message_stop" => LineOutcome::Event(ProtocolEvent::StreamEnd),
        "error" => LineOutcome::Error(
            frame
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "unknown stream error".to_string()),
        ),
        _ => match frame.delta {
            Some(delta) => decode_delta(delta),
            None => LineOutcome::Skip,
        },
    }
}

fn decode_delta(delta: RawDelta) -> LineOutcome {
    match (delta.kind.as_deref(), delta.text, delta.partial_json) {
        (Some("text_delta"), Some(text), _) => LineOutcome::Event(ProtocolEvent::TextDelta(text)),
        (Some("input_json_delta"), _, Some(fragment)) => {
            LineOutcome::Event(ProtocolEvent::ToolInputDelta(fragment))
        }
        (kind, _, _) => {
            log::debug!("stream: ignoring delta of type {:?}", kind);
            LineOutcome::Skip
        }
    }
}

/// Lazily decodes a body stream into protocol events.
///
/// The sequence ends at the sentinel, after a [`ProtocolEvent::StreamEnd`], or when the transport
/// reaches EOF. An `error` frame or a failed chunk read ends it with `Err`.
pub struct EventDecoder<S> {
    body: S,
    buffer: Vec<u8>,
    eof: bool,
    finished: bool,
}

impl<S> EventDecoder<S>
where
    S: Stream<Item = Result<Vec<u8>, ApiError>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            eof: false,
            finished: false,
        }
    }

    /// Next event, `Ok(None)` once the sequence is over.
    pub async fn next_event(&mut self) -> Result<Option<ProtocolEvent>, ApiError> {
        while !self.finished {
            let Some(line) = self.next_line().await? else {
                self.finished = true;
                break;
            };
            match decode_line(&line) {
                LineOutcome::Event(event) => {
                    if event == ProtocolEvent::StreamEnd {
                        self.finished = true;
                    }
                    return Ok(Some(event));
                }
                LineOutcome::Skip => {}
                LineOutcome::Done => self.finished = true,
                LineOutcome::Error(message) => {
                    self.finished = true;
                    return Err(ApiError::Stream(message));
                }
            }
        }
        Ok(None)
    }

    /// Next complete line, reading more chunks as needed. A final unterminated line is returned at EOF.
    async fn next_line(&mut self) -> Result<Option<String>, ApiError> {
        loop {
            if let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = self.buffer.drain(..i).collect();
                self.buffer.drain(..1);
                return Ok(Some(line_from_bytes(&line_bytes)));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.buffer);
                return Ok(Some(line_from_bytes(&rest)));
            }
            match self.body.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.eof = true,
            }
        }
    }
}

fn line_from_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}
