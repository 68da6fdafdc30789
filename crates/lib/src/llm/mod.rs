//! Messages API client and wire types.
//!
//! Requests are always streamed; the response body is handed back as a raw byte stream for
//! [`crate::stream`] to decode.

mod anthropic;

pub use anthropic::{
    default_tools, AnthropicClient, ApiError, ByteStream, ContentBlock, ImageSource, MessagesApi,
    MessagesRequest, RequestMessage, ToolDeclaration, DISPLAY_HEIGHT_PX, DISPLAY_WIDTH_PX,
};
