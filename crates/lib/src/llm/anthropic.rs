//! Anthropic Messages API client (https://api.anthropic.com/v1 by default).
//! Only streaming requests are issued; the SSE body is returned undecoded.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::config::{ApiConfig, Config};

/// Canonical display size advertised for the `computer` tool; screenshots are resized to it.
pub const DISPLAY_WIDTH_PX: u32 = 1024;
pub const DISPLAY_HEIGHT_PX: u32 = 768;

/// Raw response body chunks. Transport errors are already mapped into [`ApiError`].
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ApiError>>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("messages request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("messages api error: {0}")]
    Api(String),
    #[error("messages stream error: {0}")]
    Stream(String),
}

/// Opens a streaming Messages request. Implemented by [`AnthropicClient`]; tests supply canned streams.
#[async_trait]
pub trait MessagesApi: Send + Sync {
    /// POST the request and return the response body once a success status has been received.
    async fn stream_messages(&self, request: &MessagesRequest) -> Result<ByteStream, ApiError>;
}

/// Client for the Messages HTTP API.
#[derive(Clone)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    anthropic_version: String,
    beta_flag: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, api: &ApiConfig) -> Self {
        Self {
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            anthropic_version: api.anthropic_version.clone(),
            beta_flag: api.beta_flag.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from config, failing when no API key is available.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let key = crate::config::resolve_api_key(config)?;
        Ok(Self::new(key, &config.api))
    }
}

#[async_trait]
impl MessagesApi for AnthropicClient {
    /// POST /messages with stream: true.
    async fn stream_messages(&self, request: &MessagesRequest) -> Result<ByteStream, ApiError> {
        let url = format!("{}/messages", self.base_url);
        let res = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.anthropic_version)
            .header("anthropic-beta", &self.beta_flag)
            .json(request)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Api(format!(
                "{} {}",
                status,
                error_summary(&body).unwrap_or(body)
            )));
        }
        log::debug!("llm: stream opened ({})", res.status());
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ApiError::Request))
            .boxed())
    }
}

/// Pull `error.message` out of an API error body, collapsing whitespace.
pub(crate) fn error_summary(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let message = value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())?;
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Request body for POST /messages.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub stream: bool,
    pub tools: Vec<ToolDeclaration>,
    pub messages: Vec<RequestMessage>,
}

impl MessagesRequest {
    /// Single-turn streaming request carrying the fixed tool declarations.
    pub fn user(model: impl Into<String>, max_tokens: u32, content: Vec<ContentBlock>) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            stream: true,
            tools: default_tools(),
            messages: vec![RequestMessage {
                role: "user".to_string(),
                content,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

/// One content block of a request message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub typ: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            typ: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Built-in tool declaration (computer use beta).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    #[serde(rename = "type")]
    pub typ: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_width_px: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_height_px: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_number: Option<u32>,
}

impl ToolDeclaration {
    fn builtin(typ: &str, name: &str) -> Self {
        Self {
            typ: typ.to_string(),
            name: name.to_string(),
            display_width_px: None,
            display_height_px: None,
            display_number: None,
        }
    }
}

/// The fixed tool set sent with every request: computer, text editor and bash.
pub fn default_tools() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            display_width_px: Some(DISPLAY_WIDTH_PX),
            display_height_px: Some(DISPLAY_HEIGHT_PX),
            display_number: Some(1),
            ..ToolDeclaration::builtin("computer_20241022", "computer")
        },
        ToolDeclaration::builtin("text_editor_20241022", "str_replace_editor"),
        ToolDeclaration::builtin("bash_20241022", "bash"),
    ]
}
