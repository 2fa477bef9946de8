//! Chunk Index and Retrieval Scorer contracts.
//!
//! Documents are split into overlapping chunks, each indexed independently.
//! A query is answered by scoring an owner's chunks with a pluggable
//! [`RetrievalScorer`] and keeping the top-K.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::DocumentId;
use crate::error::IndexError;
use crate::message::OwnerId;

/// A slice of a document's extracted text.
///
/// `start_offset..end_offset` is the byte range of `text` within the source
/// text, so `&source[start_offset..end_offset] == text`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: DocumentId,
    pub ordinal: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// One scored chunk for one query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
}

/// Stores chunks per document and answers relevance queries.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Replace all chunks of a document. The new set becomes visible atomically.
    async fn upsert_chunks(
        &self,
        owner_id: &OwnerId,
        doc_id: &DocumentId,
        chunks: Vec<Chunk>,
    ) -> Result<(), IndexError>;

    /// Drop every chunk of a document. Returns whether anything was removed.
    async fn remove_document(&self, doc_id: &DocumentId) -> Result<bool, IndexError>;

    /// Top-`k` chunks for `query_text`, restricted to `scope` when given,
    /// otherwise across all of the owner's documents.
    async fn query(
        &self,
        owner_id: &OwnerId,
        scope: Option<&[DocumentId]>,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, IndexError>;
}

/// Ranks candidate chunks against a query.
///
/// Returns one score per candidate, in candidate order. Higher is better;
/// a score of zero or less means "not relevant".
#[async_trait]
pub trait RetrievalScorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, query: &str, candidates: &[Chunk]) -> Result<Vec<f32>, IndexError>;
}

/// Turns texts into embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}
