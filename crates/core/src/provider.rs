//! Provider stream contract: the abstraction over LLM backends.
//!
//! Every backend family speaks its own wire format. A [`StreamAdapter`]
//! hides that: it takes a [`NormalizedRequest`] and yields one ordered
//! sequence of [`StreamEvent`]s whose tokens always carry true deltas.
//!
//! Implementations: Ollama (NDJSON), OpenAI-compatible SSE, Gemini SSE,
//! Anthropic SSE.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cancel::CancelSignal;
use crate::error::StreamFailure;
use crate::message::Message;

/// Wire-protocol family of a backend provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Newline-delimited JSON, full-text-so-far per line.
    Ollama,
    /// `data: ` SSE lines carrying `choices[0].delta.content`.
    OpenAiCompat,
    /// `data: ` SSE lines carrying `candidates[0].content.parts[*].text`.
    Gemini,
    /// `data: ` SSE lines carrying `content_block_delta` events.
    Anthropic,
}

impl ProviderKind {
    /// Map a configured provider name to its wire family.
    ///
    /// Unknown names are assumed to expose an OpenAI-compatible endpoint.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "ollama" => Self::Ollama,
            "gemini" | "google" => Self::Gemini,
            "anthropic" | "claude" => Self::Anthropic,
            _ => Self::OpenAiCompat,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAiCompat => "openai_compat",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider-agnostic chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    /// The model to use (e.g., "llama3", "gpt-4o-mini", "gemini-1.5-flash")
    pub model: String,

    /// The conversation messages, system context first
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling mass
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

impl NormalizedRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
        }
    }
}

/// The smallest unit of streamed model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalToken {
    /// Text added since the previous token (never cumulative).
    pub delta_text: String,

    /// Set on the single completion marker that ends a successful stream.
    pub is_final: bool,

    /// The provider payload this delta came from, when kept for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_raw: Option<serde_json::Value>,
}

impl IncrementalToken {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta_text: text.into(),
            is_final: false,
            provider_raw: None,
        }
    }

    /// The empty completion marker.
    pub fn finished() -> Self {
        Self {
            delta_text: String::new(),
            is_final: true,
            provider_raw: None,
        }
    }
}

/// One item of a normalized provider stream.
///
/// A stream ends with exactly one terminal item: a final token, `Failed`,
/// or `Cancelled`. Nothing follows a terminal item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token(IncrementalToken),
    Failed(StreamFailure),
    Cancelled,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Token(token) => token.is_final,
            Self::Failed(_) | Self::Cancelled => true,
        }
    }
}

/// Identifier of one request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The Provider Stream Adapter contract.
///
/// `open` never fails directly: connection problems, upstream errors and
/// timeouts arrive as a terminal [`StreamEvent::Failed`] on the receiver.
/// When `cancel` fires the adapter closes its transport, emits
/// [`StreamEvent::Cancelled`] and stops.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// A human-readable name for this adapter (e.g., "ollama", "openrouter").
    fn name(&self) -> &str;

    async fn open(
        &self,
        request: NormalizedRequest,
        cancel: CancelSignal,
    ) -> mpsc::Receiver<StreamEvent>;
}
