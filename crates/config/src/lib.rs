//! Configuration loading, validation, and management for Quill.
//!
//! Loads configuration from `~/.quill/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.quill/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default nucleus sampling mass
    #[serde(default = "default_top_p")]
    pub default_top_p: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Chunking and retrieval
    #[serde(default)]
    pub index: IndexConfig,

    /// Context assembly budgets
    #[serde(default)]
    pub context: ContextConfig,

    /// Streaming limits
    #[serde(default)]
    pub stream: StreamConfig,

    /// Encrypted conversation storage
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_provider() -> String {
    "ollama".into()
}
fn default_model() -> String {
    "llama3".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    2048
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_top_p", &self.default_top_p)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("providers", &self.providers)
            .field("index", &self.index)
            .field("context", &self.context)
            .field("stream", &self.stream)
            .field("storage", &self.storage)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Which retrieval scorer ranks chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// BM25 keyword scoring, no network calls
    #[default]
    Lexical,
    /// Cosine similarity over provider embeddings
    Embedding,
    /// Reciprocal rank fusion of lexical and embedding rankings
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Chunk window size, in characters
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,

    /// Characters shared by consecutive chunks
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,

    /// Chunks retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub scorer: ScorerKind,

    /// Provider used for embeddings when `scorer` needs them
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

fn default_window_chars() -> usize {
    800
}
fn default_overlap_chars() -> usize {
    200
}
fn default_top_k() -> usize {
    6
}
fn default_embedding_provider() -> String {
    "openai".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
            top_k: default_top_k(),
            scorer: ScorerKind::default(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Instructions placed ahead of the assembled context
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Hard cap on the assembled context, in characters
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Attached documents pulled in full (first N only)
    #[serde(default = "default_max_scoped_documents")]
    pub max_scoped_documents: usize,

    /// Characters kept from each attached document
    #[serde(default = "default_per_document_chars")]
    pub per_document_chars: usize,

    #[serde(default)]
    pub history: HistoryConfig,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the provided context when it is relevant \
     and cite excerpts by their [doc name #n] tag."
        .into()
}
fn default_max_chars() -> usize {
    12_000
}
fn default_max_scoped_documents() -> usize {
    5
}
fn default_per_document_chars() -> usize {
    4_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_chars: default_max_chars(),
            max_scoped_documents: default_max_scoped_documents(),
            per_document_chars: default_per_document_chars(),
            history: HistoryConfig::default(),
        }
    }
}

/// Tuning for the keyword-overlap conversation memory pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_title_weight")]
    pub title_weight: f32,

    #[serde(default = "default_message_weight")]
    pub message_weight: f32,

    /// Conversations scoring below this contribute nothing
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Messages per conversation considered for scoring
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,

    /// Messages per conversation quoted in the excerpt
    #[serde(default = "default_excerpt_messages")]
    pub excerpt_messages: usize,

    /// Characters kept per quoted message
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,

    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
}

fn default_title_weight() -> f32 {
    2.0
}
fn default_message_weight() -> f32 {
    1.0
}
fn default_min_score() -> f32 {
    0.5
}
fn default_recent_messages() -> usize {
    4
}
fn default_excerpt_messages() -> usize {
    3
}
fn default_excerpt_chars() -> usize {
    400
}
fn default_max_conversations() -> usize {
    3
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            title_weight: default_title_weight(),
            message_weight: default_message_weight(),
            min_score: default_min_score(),
            recent_messages: default_recent_messages(),
            excerpt_messages: default_excerpt_messages(),
            excerpt_chars: default_excerpt_chars(),
            max_conversations: default_max_conversations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Ceiling on total streaming time per turn
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bounded buffer between adapter and subscriber
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Consecutive unparseable units tolerated before failing the stream
    #[serde(default = "default_max_consecutive_malformed")]
    pub max_consecutive_malformed: usize,

    /// Attach the provider's JSON payload to each emitted token
    #[serde(default)]
    pub keep_provider_raw: bool,
}

fn default_turn_timeout_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_channel_capacity() -> usize {
    64
}
fn default_max_consecutive_malformed() -> usize {
    3
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            turn_timeout_secs: default_turn_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            max_consecutive_malformed: default_max_consecutive_malformed(),
            keep_provider_raw: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one encrypted file per conversation
    #[serde(default = "default_conversations_dir")]
    pub conversations_dir: PathBuf,

    /// PBKDF2-HMAC-SHA256 iterations for key derivation
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Persist the partial transcript when a turn is cancelled
    #[serde(default)]
    pub save_partial_on_cancel: bool,
}

fn default_conversations_dir() -> PathBuf {
    AppConfig::config_dir().join("conversations")
}
fn default_kdf_iterations() -> u32 {
    210_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            conversations_dir: default_conversations_dir(),
            kdf_iterations: default_kdf_iterations(),
            save_partial_on_cancel: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.quill/config.toml).
    ///
    /// Environment overrides:
    /// - `QUILL_API_KEY`
    /// - `QUILL_PROVIDER`
    /// - `QUILL_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("QUILL_API_KEY").ok();
        }

        if let Ok(provider) = std::env::var("QUILL_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("QUILL_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".quill")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.default_top_p <= 0.0 || self.default_top_p > 1.0 {
            return Err(ConfigError::ValidationError(
                "default_top_p must be in (0.0, 1.0]".into(),
            ));
        }

        if self.index.window_chars == 0 {
            return Err(ConfigError::ValidationError(
                "index.window_chars must be > 0".into(),
            ));
        }

        if self.index.overlap_chars >= self.index.window_chars {
            return Err(ConfigError::ValidationError(
                "index.overlap_chars must be smaller than index.window_chars".into(),
            ));
        }

        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stream.channel_capacity must be > 0".into(),
            ));
        }

        if self.storage.kdf_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "storage.kdf_iterations must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// API key for a provider: its own entry first, then the global key.
    pub fn api_key_for(&self, provider: &str) -> Option<String> {
        self.providers
            .get(provider)
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.api_key.clone())
    }

    /// Model for a provider: its own default first, then the global default.
    pub fn model_for(&self, provider: &str) -> String {
        self.providers
            .get(provider)
            .and_then(|p| p.default_model.clone())
            .unwrap_or_else(|| self.default_model.clone())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_top_p: default_top_p(),
            default_max_tokens: default_max_tokens(),
            providers: HashMap::new(),
            index: IndexConfig::default(),
            context: ContextConfig::default(),
            stream: StreamConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
