//! Vector similarity and hybrid ranking.
//!
//! - Cosine similarity
//! - Reciprocal Rank Fusion (RRF) for merging ranked candidate lists
//! - [`EmbeddingScorer`]: cosine similarity over embeddings from an [`Embedder`]
//! - [`HybridScorer`]: RRF of the lexical and embedding rankings

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use quill_core::error::IndexError;
use quill_core::index::{Chunk, Embedder, RetrievalScorer};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::lexical::LexicalScorer;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Reciprocal Rank Fusion over per-candidate score lists.
///
/// Each list scores the same candidates. Candidates with a positive score
/// are ranked within each list; a candidate's fused score is the sum of
/// `1 / (k + rank)` over the lists it appears in (rank is 1-based).
/// Standard value is k=60. Candidates absent from every ranking score 0.
pub fn reciprocal_rank_fusion(score_lists: &[Vec<f32>], k: u32) -> Vec<f32> {
    let len = score_lists.first().map_or(0, Vec::len);
    let mut fused = vec![0.0f32; len];
    let k = k as f32;

    for scores in score_lists {
        let mut ranked: Vec<usize> = (0..scores.len()).filter(|&i| scores[i] > 0.0).collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        for (rank, idx) in ranked.into_iter().enumerate() {
            if let Some(slot) = fused.get_mut(idx) {
                *slot += 1.0 / (k + rank as f32 + 1.0);
            }
        }
    }

    fused
}

fn text_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Embeddings kept by [`EmbeddingScorer`].
pub const DEFAULT_EMBEDDING_CACHE_CAPACITY: usize = 10_000;

/// Text-keyed embeddings, evicted oldest first once over capacity.
struct EmbeddingCache {
    vectors: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl EmbeddingCache {
    fn new(capacity: usize) -> Self {
        Self {
            vectors: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: String, vector: Vec<f32>) {
        if self.vectors.insert(key.clone(), vector).is_none() {
            self.order.push_back(key);
        }
        while self.vectors.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.vectors.remove(&oldest);
        }
    }
}

/// Scores chunks by cosine similarity between query and chunk embeddings.
///
/// Chunk embeddings are cached by a SHA-256 of the chunk text, so a chunk is
/// embedded once no matter how often it is a candidate. The cache holds at
/// most [`DEFAULT_EMBEDDING_CACHE_CAPACITY`] entries unless configured with
/// [`EmbeddingScorer::with_cache_capacity`].
pub struct EmbeddingScorer {
    embedder: Arc<dyn Embedder>,
    cache: RwLock<EmbeddingCache>,
}

impl EmbeddingScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            cache: RwLock::new(EmbeddingCache::new(DEFAULT_EMBEDDING_CACHE_CAPACITY)),
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = RwLock::new(EmbeddingCache::new(capacity));
        self
    }

    pub async fn cached_embeddings(&self) -> usize {
        self.cache.read().await.vectors.len()
    }

    async fn embeddings_for(&self, candidates: &[Chunk]) -> Result<Vec<Vec<f32>>, IndexError> {
        let keys: Vec<String> = candidates.iter().map(|c| text_key(&c.text)).collect();

        // Resolved locally so eviction during this call cannot lose a vector.
        let mut resolved: HashMap<String, Vec<f32>> = HashMap::new();
        let mut missing: Vec<(String, String)> = Vec::new();
        {
            let cache = self.cache.read().await;
            for (key, chunk) in keys.iter().zip(candidates) {
                if resolved.contains_key(key) || missing.iter().any(|(k, _)| k == key) {
                    continue;
                }
                match cache.vectors.get(key) {
                    Some(vector) => {
                        resolved.insert(key.clone(), vector.clone());
                    }
                    None => missing.push((key.clone(), chunk.text.clone())),
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                embedder = self.embedder.name(),
                count = missing.len(),
                "Embedding uncached chunks"
            );
            let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(IndexError::EmbeddingFailed(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                )));
            }
            let mut cache = self.cache.write().await;
            for ((key, _), vector) in missing.into_iter().zip(vectors) {
                cache.insert(key.clone(), vector.clone());
                resolved.insert(key, vector);
            }
        }

        Ok(keys
            .iter()
            .map(|k| resolved.get(k).cloned().unwrap_or_default())
            .collect())
    }
}

#[async_trait]
impl RetrievalScorer for EmbeddingScorer {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn score(&self, query: &str, candidates: &[Chunk]) -> Result<Vec<f32>, IndexError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::EmbeddingFailed("no embedding for query".into()))?;

        let chunk_vecs = self.embeddings_for(candidates).await?;
        Ok(chunk_vecs
            .iter()
            .map(|v| cosine_similarity(&query_vec, v))
            .collect())
    }
}

/// Fuses lexical (BM25) and embedding rankings with RRF.
///
/// If the embedding side fails, falls back to the lexical ranking alone.
pub struct HybridScorer {
    lexical: LexicalScorer,
    embedding: EmbeddingScorer,
    rrf_k: u32,
}

impl HybridScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            lexical: LexicalScorer::new(),
            embedding: EmbeddingScorer::new(embedder),
            rrf_k: 60,
        }
    }
}

#[async_trait]
impl RetrievalScorer for HybridScorer {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn score(&self, query: &str, candidates: &[Chunk]) -> Result<Vec<f32>, IndexError> {
        let lexical = self.lexical.score_sync(query, candidates);
        match self.embedding.score(query, candidates).await {
            Ok(semantic) => Ok(reciprocal_rank_fusion(&[lexical, semantic], self.rrf_k)),
            Err(e) => {
                warn!(error = %e, "Embedding scorer failed, using lexical ranking only");
                Ok(lexical)
            }
        }
    }
}
