//! Error types for the Quill domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; the top-level [`Error`]
//! aggregates them for callers that do not care which layer failed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Quill operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Document store ---
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    // --- Chunk index / scoring ---
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    // --- Provider streams ---
    #[error("Stream failed: {0}")]
    Stream(#[from] StreamFailure),

    #[error("Subscription error: {0}")]
    Subscribe(#[from] SubscribeError),

    // --- Encrypted storage ---
    #[error("Decryption failed: {0}")]
    Decryption(#[from] DecryptionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Text extraction did not produce content for a document.
///
/// Recoverable: the context assembler turns this into a placeholder snippet.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("No text could be extracted from document {document_id}: {reason}")]
    Failed { document_id: String, reason: String },

    #[error("Document not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Error)]
pub enum IndexError {
    #[error("Index storage error: {0}")]
    Storage(String),

    #[error("Scoring failed: {0}")]
    Scoring(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid chunking parameters: {0}")]
    InvalidParameters(String),
}

/// Why a provider stream ended in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Connection could not be made, or broke mid-stream.
    TransportError,
    /// Too many consecutive unparseable wire units.
    MalformedStream,
    /// The per-turn duration ceiling was exceeded.
    Timeout,
    /// The provider itself reported an error (message kept verbatim).
    Upstream,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransportError => "transport error",
            Self::MalformedStream => "malformed stream",
            Self::Timeout => "timeout",
            Self::Upstream => "upstream error",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct StreamFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl StreamFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureReason::TransportError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureReason::MalformedStream, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Timeout, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Upstream, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// A live subscriber already exists for this turn. Caller bug.
    #[error("Turn {0} already has a live subscriber")]
    DuplicateSubscription(String),

    #[error("Unknown or finished turn: {0}")]
    UnknownTurn(String),
}

/// Why an encrypted conversation could not be opened.
///
/// `WrongSecret` is recoverable by re-prompting; `Corrupted` is not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptionError {
    #[error("The secret does not match this conversation")]
    WrongSecret,

    #[error("Conversation data is corrupted: {0}")]
    Corrupted(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid record key: {0}")]
    InvalidKey(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}
