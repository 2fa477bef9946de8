//! In-memory chunk index.
//!
//! Each document's chunk set is stored behind an `Arc` and replaced whole on
//! re-index. Readers clone the `Arc`s they need under a short read lock and
//! score outside it, so a query running during a rebuild sees either the
//! complete old set or the complete new set, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quill_core::document::DocumentId;
use quill_core::error::IndexError;
use quill_core::index::{Chunk, ChunkIndex, RetrievalResult, RetrievalScorer};
use quill_core::message::OwnerId;
use tokio::sync::RwLock;
use tracing::debug;

struct IndexedDocument {
    owner_id: OwnerId,
    chunks: Arc<[Chunk]>,
}

pub struct InMemoryChunkIndex {
    documents: RwLock<HashMap<DocumentId, Arc<IndexedDocument>>>,
    scorer: Arc<dyn RetrievalScorer>,
}

impl InMemoryChunkIndex {
    pub fn new(scorer: Arc<dyn RetrievalScorer>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            scorer,
        }
    }

    /// Number of chunks currently published for a document.
    pub async fn chunk_count(&self, doc_id: &DocumentId) -> usize {
        self.documents
            .read()
            .await
            .get(doc_id)
            .map_or(0, |d| d.chunks.len())
    }

    /// Snapshot of a document's published chunks.
    pub async fn chunks(&self, doc_id: &DocumentId) -> Vec<Chunk> {
        self.documents
            .read()
            .await
            .get(doc_id)
            .map(|d| d.chunks.to_vec())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChunkIndex for InMemoryChunkIndex {
    async fn upsert_chunks(
        &self,
        owner_id: &OwnerId,
        doc_id: &DocumentId,
        chunks: Vec<Chunk>,
    ) -> Result<(), IndexError> {
        if let Some(stray) = chunks.iter().find(|c| &c.doc_id != doc_id) {
            return Err(IndexError::Storage(format!(
                "chunk {} belongs to {}, not {}",
                stray.ordinal, stray.doc_id, doc_id
            )));
        }

        // Build the full replacement before taking the write lock.
        let entry = Arc::new(IndexedDocument {
            owner_id: owner_id.clone(),
            chunks: chunks.into(),
        });
        let count = entry.chunks.len();
        self.documents.write().await.insert(doc_id.clone(), entry);
        debug!(doc_id = %doc_id, chunks = count, "Published chunk set");
        Ok(())
    }

    async fn remove_document(&self, doc_id: &DocumentId) -> Result<bool, IndexError> {
        Ok(self.documents.write().await.remove(doc_id).is_some())
    }

    async fn query(
        &self,
        owner_id: &OwnerId,
        scope: Option<&[DocumentId]>,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<RetrievalResult>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let snapshot: Vec<Arc<IndexedDocument>> = {
            let documents = self.documents.read().await;
            documents
                .iter()
                .filter(|(id, d)| {
                    &d.owner_id == owner_id && scope.is_none_or(|ids| ids.contains(*id))
                })
                .map(|(_, d)| Arc::clone(d))
                .collect()
        };

        let candidates: Vec<Chunk> = snapshot
            .iter()
            .flat_map(|d| d.chunks.iter().cloned())
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let scores = self.scorer.score(query_text, &candidates).await?;
        if scores.len() != candidates.len() {
            return Err(IndexError::Scoring(format!(
                "{} returned {} scores for {} candidates",
                self.scorer.name(),
                scores.len(),
                candidates.len()
            )));
        }

        let mut scored: Vec<(f32, Chunk)> = scores
            .into_iter()
            .zip(candidates)
            .filter(|(score, _)| *score > 0.0)
            .collect();

        // Highest score first; ties broken by position for stable output.
        scored.sort_by(|(sa, ca), (sb, cb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ca.doc_id.cmp(&cb.doc_id))
                .then(ca.ordinal.cmp(&cb.ordinal))
        });
        scored.truncate(k);

        debug!(
            owner = %owner_id,
            scorer = self.scorer.name(),
            hits = scored.len(),
            "Chunk query complete"
        );

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, chunk))| RetrievalResult {
                chunk,
                score,
                rank: i + 1,
            })
            .collect())
    }
}
