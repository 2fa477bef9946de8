//! Message and conversation record domain types.
//!
//! These are the value objects that flow through a turn:
//! user query → context assembly → provider stream → transcript → encrypted store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The user who owns documents and conversations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// Instructions and injected context
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Documents the user attached to this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attached_file_ids: Vec<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            attached_file_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Attach document ids to this message.
    pub fn with_attachments(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.attached_file_ids = ids.into_iter().collect();
        self
    }
}

/// A persisted conversation transcript.
///
/// Created on the first assistant reply of a new conversation and mutated on
/// every later turn. Only one writer per id at a time; the caller enforces that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub owner_id: OwnerId,
    pub title: String,
    pub model: String,
    pub provider: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Create an empty record.
    pub fn new(
        owner_id: OwnerId,
        title: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            owner_id,
            title: title.into(),
            model: model.into(),
            provider: provider.into(),
            messages: Vec::new(),
            pinned: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message and bump `updated_at`.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

/// Derive a short conversation title from the first user query.
pub fn title_from_query(query: &str) -> String {
    const MAX: usize = 60;
    let line = query.lines().next().unwrap_or("").trim();
    if line.chars().count() <= MAX {
        return line.to_string();
    }
    let cut: String = line.chars().take(MAX).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello!");
        assert!(msg.attached_file_ids.is_empty());
    }

    #[test]
    fn record_push_bumps_updated_at() {
        let mut rec = ConversationRecord::new(OwnerId::from("u1"), "t", "ollama", "llama3");
        let created = rec.created_at;
        rec.push(Message::user("First"));
        assert_eq!(rec.messages.len(), 1);
        assert!(rec.updated_at >= created);
    }

    #[test]
    fn recent_returns_tail() {
        let mut rec = ConversationRecord::new(OwnerId::from("u1"), "t", "ollama", "llama3");
        for i in 0..5 {
            rec.push(Message::user(format!("m{i}")));
        }
        let tail: Vec<_> = rec.recent(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, vec!["m3", "m4"]);
        assert_eq!(rec.recent(10).len(), 5);
    }

    #[test]
    fn attachments_serialize_only_when_present() {
        let plain = serde_json::to_string(&Message::user("x")).unwrap();
        assert!(!plain.contains("attached_file_ids"));

        let with = Message::user("x").with_attachments(vec!["doc-1".to_string()]);
        let json = serde_json::to_string(&with).unwrap();
        assert!(json.contains("doc-1"));
    }

    #[test]
    fn title_is_truncated() {
        assert_eq!(title_from_query("Short question\nmore"), "Short question");
        let long = "word ".repeat(30);
        let title = title_from_query(&long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= 61);
    }
}
