//! Document domain types and the Document Store contract.
//!
//! The store itself (upload handling, file bytes, format-specific extraction)
//! lives outside the core. The core only needs a way to list an owner's
//! documents and to pull extracted plain text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;
use crate::message::OwnerId;

/// Unique identifier for an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An uploaded document.
///
/// `extracted_text` is `None` when extraction failed or the format is not
/// supported. That is a legitimate state, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub owner_id: OwnerId,
    pub display_name: String,
    pub byte_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// Read access to uploaded documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Look up a document's metadata.
    async fn get(&self, id: &DocumentId) -> Option<Document>;

    /// All documents belonging to an owner.
    async fn list(&self, owner_id: &OwnerId) -> Vec<Document>;

    /// Pull the extracted plain text for a document.
    async fn extract_text(&self, document: &Document) -> Result<String, ExtractionError>;
}
