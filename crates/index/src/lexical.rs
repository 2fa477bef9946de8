//! Keyword extraction and BM25 lexical scoring.
//!
//! `keywords` is shared with the conversation-history relevance pass, so
//! both use the same notion of "a word that matters".

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use quill_core::error::IndexError;
use quill_core::index::{Chunk, RetrievalScorer};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could", "did", "do",
    "does", "for", "from", "had", "has", "have", "how", "i", "if", "in", "into", "is", "it",
    "its", "me", "my", "of", "on", "or", "our", "so", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "to", "was", "we", "were", "what", "when", "where",
    "which", "who", "why", "will", "with", "would", "you", "your",
];

const MIN_WORD_LEN: usize = 2;

/// Lowercased alphanumeric words of `text`, stop words removed, in order.
pub fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Distinct keywords of `text`.
pub fn keyword_set(text: &str) -> HashSet<String> {
    keywords(text).into_iter().collect()
}

/// Fraction of `query` keywords that also appear in `other` (0.0–1.0).
pub fn overlap_ratio(query: &HashSet<String>, other: &HashSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(other).count();
    shared as f32 / query.len() as f32
}

/// BM25 over the candidate set handed to it.
///
/// Document frequencies are computed per query from the candidates, so the
/// scorer is stateless and needs no index rebuild when documents change.
#[derive(Debug, Clone)]
pub struct LexicalScorer {
    k1: f32,
    b: f32,
}

impl LexicalScorer {
    pub fn new() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }

    pub fn with_params(k1: f32, b: f32) -> Self {
        Self { k1, b }
    }

    /// Synchronous scoring, shared with the hybrid scorer.
    pub fn score_sync(&self, query: &str, candidates: &[Chunk]) -> Vec<f32> {
        let query_terms = keyword_set(query);
        if query_terms.is_empty() || candidates.is_empty() {
            return vec![0.0; candidates.len()];
        }

        let term_freqs: Vec<HashMap<String, u32>> = candidates
            .iter()
            .map(|c| {
                let mut tf = HashMap::new();
                for word in keywords(&c.text) {
                    *tf.entry(word).or_insert(0) += 1;
                }
                tf
            })
            .collect();

        let doc_lens: Vec<f32> = term_freqs
            .iter()
            .map(|tf| tf.values().sum::<u32>() as f32)
            .collect();
        let avg_len = (doc_lens.iter().sum::<f32>() / doc_lens.len() as f32).max(1.0);
        let n = candidates.len() as f32;

        let idf: HashMap<&str, f32> = query_terms
            .iter()
            .map(|term| {
                let df = term_freqs.iter().filter(|tf| tf.contains_key(term)).count() as f32;
                let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                (term.as_str(), idf)
            })
            .collect();

        term_freqs
            .iter()
            .zip(doc_lens.iter())
            .map(|(tf, &len)| {
                query_terms
                    .iter()
                    .filter_map(|term| {
                        let f = *tf.get(term)? as f32;
                        let norm = self.k1 * (1.0 - self.b + self.b * len / avg_len);
                        Some(idf[term.as_str()] * f * (self.k1 + 1.0) / (f + norm))
                    })
                    .sum()
            })
            .collect()
    }
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetrievalScorer for LexicalScorer {
    fn name(&self) -> &str {
        "lexical"
    }

    async fn score(&self, query: &str, candidates: &[Chunk]) -> Result<Vec<f32>, IndexError> {
        Ok(self.score_sync(query, candidates))
    }
}
