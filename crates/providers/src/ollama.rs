//! Ollama native chat adapter.
//!
//! `POST /api/chat` with `stream: true` answers with newline-delimited JSON.
//! Each line carries the response text generated so far in
//! `message.content` (or `response` on the generate endpoint), so deltas
//! are recovered by the snapshot normalizer. `done: true` ends the stream;
//! `{"error": "..."}` reports a failure.

use async_trait::async_trait;
use quill_core::cancel::CancelSignal;
use quill_core::message::Message;
use quill_core::provider::{NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{Framing, StreamLimits, WireEvent, WireFormat, http_client, spawn_http_stream};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaAdapter {
    base_url: String,
    client: reqwest::Client,
    limits: StreamLimits,
}

impl OllamaAdapter {
    pub fn new(base_url: Option<&str>, limits: StreamLimits) -> Self {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            // an OpenAI-style base URL points at the compat layer, not the native API
            .trim_end_matches("/v1")
            .to_string();
        Self {
            base_url,
            client: http_client(&limits),
            limits,
        }
    }

    fn body(request: &NormalizedRequest) -> ChatRequest<'_> {
        ChatRequest {
            model: &request.model,
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            stream: true,
            options: Options {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
            },
        }
    }
}

#[async_trait]
impl StreamAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn name(&self) -> &str {
        "ollama"
    }

    async fn open(
        &self,
        request: NormalizedRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model = %request.model, %url, "Opening Ollama stream");
        let http = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&Self::body(&request));
        spawn_http_stream(OllamaWire, http, self.limits.clone(), cancel)
    }
}

/// NDJSON, cumulative text.
///
/// Every line's `content` (or `response`) is read as the full reply so far
/// and reduced to its new suffix. An endpoint that sent true deltas would
/// lose a fragment equal to the text before it: `"ha"` then `"ha"` yields
/// `"ha"` once.
pub struct OllamaWire;

impl WireFormat for OllamaWire {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn framing(&self) -> Framing {
        Framing::NdJson
    }

    fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
        let line: StreamLine = serde_json::from_str(payload).map_err(|e| e.to_string())?;

        if let Some(error) = line.error {
            return Ok(vec![WireEvent::UpstreamError(error)]);
        }

        let mut events = Vec::with_capacity(2);
        let text = line.message.map(|m| m.content).or(line.response);
        match text {
            Some(text) => events.push(WireEvent::Snapshot(text)),
            None if !line.done => events.push(WireEvent::Ignore),
            None => {}
        }
        if line.done {
            events.push(WireEvent::Done);
        }
        Ok(events)
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    stream: bool,
    options: Options,
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

#[derive(Debug, Serialize)]
struct Options {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}
