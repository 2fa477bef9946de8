//! Provider stream adapters for Quill.
//!
//! Every adapter implements `quill_core::StreamAdapter` and normalizes its
//! provider's wire format into one ordered stream of true-delta tokens.
//! The router selects the adapter for a configured provider name.

pub mod adapter;
pub mod anthropic;
pub mod embedder;
pub mod gemini;
pub mod ollama;
pub mod openai_compat;
pub mod router;

pub use adapter::{
    AdapterState, DeltaNormalizer, Framing, LineBuffer, StreamLimits, WireDecoder, WireEvent,
    WireFormat, pump,
};
pub use anthropic::AnthropicAdapter;
pub use embedder::OpenAiEmbedder;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai_compat::OpenAiCompatAdapter;
pub use router::{ProviderRouter, build_adapter, build_from_config};
