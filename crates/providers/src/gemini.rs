//! Google Gemini adapter.
//!
//! `models/{model}:streamGenerateContent?alt=sse` streams SSE whose payloads
//! are `GenerateContentResponse` objects. Text deltas are the concatenated
//! `candidates[0].content.parts[*].text`. There is no end sentinel: the
//! stream completes when the connection closes cleanly.

use async_trait::async_trait;
use quill_core::cancel::CancelSignal;
use quill_core::message::Role;
use quill_core::provider::{NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{Framing, StreamLimits, WireEvent, WireFormat, http_client, spawn_http_stream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    limits: StreamLimits,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>, limits: StreamLimits) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: http_client(&limits),
            limits,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// System messages become `systemInstruction`; assistant turns use the
    /// `model` role.
    fn body(request: &NormalizedRequest) -> GenerateRequest<'_> {
        let system: Vec<Part<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| Part { text: &m.content })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| Content {
                role: match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                },
                parts: vec![Part { text: &m.content }],
            })
            .collect();

        GenerateRequest {
            contents,
            system_instruction: (!system.is_empty()).then_some(SystemInstruction { parts: system }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

#[async_trait]
impl StreamAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn name(&self) -> &str {
        "gemini"
    }

    async fn open(
        &self,
        request: NormalizedRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        debug!(model = %request.model, "Opening Gemini stream");
        let http = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&Self::body(&request));
        spawn_http_stream(GeminiWire, http, self.limits.clone(), cancel)
    }
}

/// SSE with `parts` deltas; completes on close.
pub struct GeminiWire;

impl WireFormat for GeminiWire {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn framing(&self) -> Framing {
        Framing::Sse
    }

    fn decode(&self, payload: &str) -> Result<Vec<WireEvent>, String> {
        let response: StreamResponse = serde_json::from_str(payload).map_err(|e| e.to_string())?;

        if let Some(error) = response.error {
            return Ok(vec![WireEvent::UpstreamError(error.message)]);
        }
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Ok(vec![WireEvent::UpstreamError(format!(
                "prompt blocked: {reason}"
            ))]);
        }

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        Ok(vec![if text.is_empty() {
            WireEvent::Ignore
        } else {
            WireEvent::Delta(text)
        }])
    }
}

// --- Request types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

// --- Stream types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
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
    use quill_core::message::Message;

    #[test]
    fn parts_are_concatenated_and_close_completes() {
        let events = decode_all(
            GeminiWire,
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"},{\"text\":\"lo\"}],\"role\":\"model\"}}]}\r\n\r\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" world\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
            ],
        );
        assert_eq!(events, vec![token("Hello"), token(" world"), done()]);
    }

    #[test]
    fn metadata_only_chunk_is_ignored() {
        let events = decode_all(
            GeminiWire,
            &[
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}\n\n",
                "data: {\"usageMetadata\":{\"totalTokenCount\":12}}\n\n",
            ],
        );
        assert_eq!(events, vec![token("ok"), done()]);
    }

    #[test]
    fn error_object_fails_verbatim() {
        let events = decode_all(
            GeminiWire,
            &["data: {\"error\":{\"code\":400,\"message\":\"API key not valid.\",\"status\":\"INVALID_ARGUMENT\"}}\n\n"],
        );
        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::upstream("API key not valid."))]
        );
    }

    #[test]
    fn blocked_prompt_fails() {
        let events = decode_all(
            GeminiWire,
            &["data: {\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}\n\n"],
        );
        assert_eq!(
            events,
            vec![StreamEvent::Failed(StreamFailure::upstream("prompt blocked: SAFETY"))]
        );
    }

    #[test]
    fn request_body_splits_system_instruction() {
        let request = NormalizedRequest::new(
            "gemini-1.5-flash",
            vec![
                Message::system("context"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("again"),
            ],
        );
        let body = serde_json::to_value(GeminiAdapter::body(&request)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "context");
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }
}
