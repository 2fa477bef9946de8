//! Anthropic Messages API adapter.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Streaming via SSE with typed events: text arrives in
//!   `content_block_delta` (`delta.text`), `message_stop` ends the stream
//!   and `error` events carry upstream failures

use async_trait::async_trait;
use quill_core::cancel::CancelSignal;
use quill_core::message::{Message, Role};
use quill_core::provider::{NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{Framing, StreamLimits, WireEvent, WireFormat, http_client, spawn_http_stream};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    limits: StreamLimits,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, limits: StreamLimits) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: http_client(&limits),
            limits,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Extract system messages from the message list.
    /// Anthropic puts system prompt as a top-level field, not in messages.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system = (!system.is_empty()).then(|| {
            system
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        });
        (system, rest)
    }

    fn body(request: &NormalizedRequest) -> MessagesRequest<'_> {
        let (system, rest) = Self::extract_system(&request.messages);
        MessagesRequest {
            model: &request.model,
            system,
            messages: rest
                .into_iter()
                .map(|m| ApiMessage {
                    role: if m.role == Role::Assistant { "assistant" } else { "user" },
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: true,
        }
    }
}

#[async_trait]
impl StreamAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn open(
        &self,
        request: NormalizedRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = %request.model, "Opening Anthropic stream");
        let http = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&Self::body(&request));
        spawn_http_stream(AnthropicWire, http, self.limits.clone(), cancel)
    }
}

/// SSE with typed JSON events.
pub struct AnthropicWire;

impl WireFormat for AnthropicWire {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
        let event: SseEvent = serde_json::from_str(payload).map_err(|e| e.to_string())?;
        Ok(vec![match event {
            SseEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } => WireEvent::Delta(text),
            SseEvent::MessageStop => WireEvent::Done,
            SseEvent::Error { error } => WireEvent::UpstreamError(error.message),
            _ => WireEvent::Ignore,
        }])
    }
}

// --- Request types ---

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// --- Stream event types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent {
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{decode_all, done, token};
    use quill_core::error::StreamFailure;

    #[test]
    fn extract_system_messages() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Hello"),
            Message::system("Be concise"),
        ];
        let (system, rest) = AnthropicAdapter::extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn text_deltas_until_message_stop() {
        let events = decode_all(
            AnthropicWire,
            &[
                "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
                "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
                "event: ping\ndata: {\"type\": \"ping\"}\n\n",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
                "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
                "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
                "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ],
        );
        assert_eq!(events, vec![token("Hel"), token("lo"), done()]);
    }

    #[test]
    fn non_text_deltas_are_ignored() {
        let events = decode_all(
            AnthropicWire,
            &["data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\"}}\n\n"],
        );
        assert_eq!(events, vec![done()]);
    }

    #[test]
    fn error_event_fails_verbatim() {
        let events = decode_all(
            AnthropicWire,
            &["event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n"],
        );
        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::upstream("Overloaded"))]
        );
    }

    #[test]
    fn request_body_defaults_max_tokens() {
        let request = NormalizedRequest::new(
            "claude-3-5-haiku-latest",
            vec![Message::system("ctx"), Message::user("hi")],
        );
        let body = serde_json::to_value(AnthropicAdapter::body(&request)).unwrap();
        assert_eq!(body["system"], "ctx");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
