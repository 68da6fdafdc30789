//! Streaming response handling: SSE decoding and response accumulation.

mod accumulator;
mod decoder;

pub use accumulator::{
    accumulate, AccumulatedResponse, CompletedResponse, ResponseAccumulator, ToolInvocation,
};
pub use decoder::{decode_line, EventDecoder, LineOutcome, ProtocolEvent, DONE_SENTINEL};
