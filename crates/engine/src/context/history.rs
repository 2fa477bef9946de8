//! Conversation-history relevance pass.
//!
//! A cheap keyword filter, not semantic search. Each of the owner's other
//! conversations is scored by how many of the query's keywords appear in
//! its title (weighted higher) and in its most recent messages (weighted
//! lower). Conversations at or above `min_score` contribute a short excerpt
//! of their latest messages.

use std::collections::HashSet;

use quill_config::HistoryConfig;
use quill_core::message::{ConversationId, ConversationRecord, Role};
use quill_index::{keyword_set, overlap_ratio};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMatch {
    pub conversation_id: ConversationId,
    pub title: String,
    pub score: f32,
    /// `role: text` lines, oldest first.
    pub excerpt: Vec<String>,
}

/// Relevance of one conversation to the query keywords.
pub fn score_conversation(
    query: &HashSet<String>,
    record: &ConversationRecord,
    config: &HistoryConfig,
) -> f32 {
    let title = keyword_set(&record.title);
    let recent: HashSet<String> = record
        .recent(config.recent_messages)
        .iter()
        .flat_map(|m| keyword_set(&m.content))
        .collect();

    config.title_weight * overlap_ratio(query, &title)
        + config.message_weight * overlap_ratio(query, &recent)
}

/// Best-scoring conversations for `query`, highest first.
pub fn relevant_conversations(
    query: &str,
    records: &[ConversationRecord],
    exclude: Option<&ConversationId>,
    config: &HistoryConfig,
) -> Vec<HistoryMatch> {
    let query_keywords = keyword_set(query);
    if query_keywords.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(&ConversationRecord, f32)> = records
        .iter()
        .filter(|r| exclude.is_none_or(|id| &r.id != id))
        .map(|r| (r, score_conversation(&query_keywords, r, config)))
        .filter(|(_, score)| *score > 0.0 && *score >= config.min_score)
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.truncate(config.max_conversations);

    scored
        .into_iter()
        .map(|(record, score)| HistoryMatch {
            conversation_id: record.id.clone(),
            title: record.title.clone(),
            score,
            excerpt: excerpt(record, config),
        })
        .collect()
}

fn excerpt(record: &ConversationRecord, config: &HistoryConfig) -> Vec<String> {
    let spoken: Vec<_> = record
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();
    let start = spoken.len().saturating_sub(config.excerpt_messages);

    spoken[start..]
        .iter()
        .map(|m| {
            let text = clip(m.content.trim(), config.excerpt_chars);
            format!("{}: {}", m.role.as_str(), text)
        })
        .collect()
}

/// Render matches as the history section text.
pub fn summarize(matches: &[HistoryMatch]) -> String {
    let mut out = String::new();
    for (i, m) in matches.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("Conversation \"{}\":\n", m.title));
        for line in &m.excerpt {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub(crate) fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut cut: String = text.chars().take(max - 1).collect();
    cut.push('…');
    cut
}
