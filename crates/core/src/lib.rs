//! # Quill Core
//!
//! Domain types, traits, and error definitions for the Quill context
//! assembly and streaming engine. This crate has **no framework
//! dependencies**; it defines the domain model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is defined as a trait here (document store, chunk
//! index, retrieval scorer, stream adapter, conversation backend).
//! Implementations live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with scripted stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod cancel;
pub mod document;
pub mod error;
pub mod index;
pub mod message;
pub mod provider;
pub mod storage;

// Re-export key types at crate root for ergonomics
pub use cancel::{CancelHandle, CancelSignal};
pub use document::{Document, DocumentId, DocumentStore};
pub use error::{
    DecryptionError, Error, ExtractionError, FailureReason, IndexError, Result, StorageError,
    StreamFailure, SubscribeError,
};
pub use index::{Chunk, ChunkIndex, Embedder, RetrievalResult, RetrievalScorer};
pub use message::{ConversationId, ConversationRecord, Message, OwnerId, Role};
pub use provider::{
    IncrementalToken, NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent, TurnId,
};
pub use storage::{ConversationBackend, ConversationDirectory};
