//! Document chunking, chunk index and retrieval scorers for Quill.

pub mod chunker;
pub mod documents;
pub mod in_memory;
pub mod lexical;
pub mod library;
pub mod vector;

use std::sync::Arc;

use quill_config::{IndexConfig, ScorerKind};
use quill_core::index::{Embedder, RetrievalScorer};

pub use chunker::Chunker;
pub use documents::{InMemoryDocumentStore, document_id_for};
pub use in_memory::InMemoryChunkIndex;
pub use lexical::{LexicalScorer, keyword_set, keywords, overlap_ratio};
pub use library::{IngestReport, Library};
pub use vector::{
    DEFAULT_EMBEDDING_CACHE_CAPACITY, EmbeddingScorer, HybridScorer, cosine_similarity,
    reciprocal_rank_fusion,
};

/// Build the configured scorer. Embedding-based scorers need an embedder;
/// without one they fall back to lexical scoring.
pub fn build_scorer(
    config: &IndexConfig,
    embedder: Option<Arc<dyn Embedder>>,
) -> Arc<dyn RetrievalScorer> {
    match (config.scorer, embedder) {
        (ScorerKind::Lexical, _) => Arc::new(LexicalScorer::new()),
        (ScorerKind::Embedding, Some(e)) => Arc::new(EmbeddingScorer::new(e)),
        (ScorerKind::Hybrid, Some(e)) => Arc::new(HybridScorer::new(e)),
        (kind, None) => {
            tracing::warn!(scorer = ?kind, "No embedder available, using lexical scorer");
            Arc::new(LexicalScorer::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_scorer_falls_back_without_embedder() {
        let config = IndexConfig {
            scorer: ScorerKind::Hybrid,
            ..IndexConfig::default()
        };
        assert_eq!(build_scorer(&config, None).name(), "lexical");
        assert_eq!(build_scorer(&IndexConfig::default(), None).name(), "lexical");
    }
}
