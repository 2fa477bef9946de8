//! OpenAI-compatible chat completions adapter.
//!
//! Works with: OpenAI, OpenRouter, Groq, DeepSeek, Together AI, Fireworks,
//! vLLM, llama.cpp and any endpoint exposing `/chat/completions`.
//!
//! The stream is SSE: every `data:` payload is a JSON chunk whose text delta
//! lives at `choices[0].delta.content`, and `data: [DONE]` ends it.

use async_trait::async_trait;
use quill_core::cancel::CancelSignal;
use quill_core::message::Message;
use quill_core::provider::{NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{Framing, StreamLimits, WireEvent, WireFormat, http_client, spawn_http_stream};

/// An OpenAI-compatible streaming adapter.
pub struct OpenAiCompatAdapter {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    limits: StreamLimits,
}

impl OpenAiCompatAdapter {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        limits: StreamLimits,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: http_client(&limits),
            limits,
        }
    }

    /// Create an OpenRouter adapter (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>, limits: StreamLimits) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key, limits)
    }

    /// Create an OpenAI adapter (convenience constructor).
    pub fn openai(api_key: impl Into<String>, limits: StreamLimits) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key, limits)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn body(request: &NormalizedRequest) -> ChatRequest<'_> {
        ChatRequest {
            model: &request.model,
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream: true,
        }
    }
}

#[async_trait]
impl StreamAdapter for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompat
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn open(
        &self,
        request: NormalizedRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let mut http = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&Self::body(&request));
        if !self.api_key.is_empty() {
            http = http.bearer_auth(&self.api_key);
        }
        spawn_http_stream(OpenAiWire, http, self.limits.clone(), cancel)
    }
}

/// SSE with true deltas and a `[DONE]` sentinel.
pub struct OpenAiWire;

impl WireFormat for OpenAiWire {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
        if payload == "[DONE]" {
            return Ok(vec![WireEvent::Done]);
        }

        let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| e.to_string())?;
        if let Some(error) = chunk.error {
            return Ok(vec![WireEvent::UpstreamError(error.message)]);
        }

        // finish_reason alone is not the end; [DONE] or a clean close is.
        let event = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|text| !text.is_empty())
            .map_or(WireEvent::Ignore, WireEvent::Delta);
        Ok(vec![event])
    }
}

// --- API types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a Message> for ApiMessage<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            role: m.role.as_str(),
            content: &m.content,
        }
    }
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}
