//! In-memory document store.
//!
//! Holds document metadata and whatever text extraction produced. Format
//! parsing happens before a document reaches the store; the store only
//! records the outcome, including failures.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use quill_core::document::{Document, DocumentId, DocumentStore};
use quill_core::error::ExtractionError;
use quill_core::message::OwnerId;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Document,
    failure: Option<String>,
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, StoredDocument>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub async fn insert(&self, document: Document) {
        debug!(doc_id = %document.id, name = %document.display_name, "Stored document");
        self.documents.write().await.insert(
            document.id.clone(),
            StoredDocument {
                document,
                failure: None,
            },
        );
    }

    /// Add a document whose extraction failed, remembering why.
    pub async fn insert_failed(&self, mut document: Document, reason: impl Into<String>) {
        document.extracted_text = None;
        let reason = reason.into();
        warn!(doc_id = %document.id, %reason, "Stored document without extracted text");
        self.documents.write().await.insert(
            document.id.clone(),
            StoredDocument {
                document,
                failure: Some(reason),
            },
        );
    }

    pub async fn remove(&self, id: &DocumentId) -> Option<Document> {
        self.documents.write().await.remove(id).map(|s| s.document)
    }

    /// Read a file from disk and store it. UTF-8 files are stored as plain
    /// text; anything else is stored with extraction marked as failed.
    pub async fn insert_file(&self, owner_id: &OwnerId, path: &Path) -> std::io::Result<Document> {
        let bytes = tokio::fs::read(path).await?;
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut document = Document {
            id: document_id_for(owner_id, &display_name),
            owner_id: owner_id.clone(),
            display_name,
            byte_size: bytes.len() as u64,
            extracted_text: None,
        };

        match String::from_utf8(bytes) {
            Ok(text) => {
                document.extracted_text = Some(text);
                self.insert(document.clone()).await;
            }
            Err(_) => {
                self.insert_failed(document.clone(), "unsupported format: not UTF-8 text")
                    .await;
            }
        }
        Ok(document)
    }
}

/// Stable id derived from owner and display name, so re-adding the same file
/// replaces the earlier copy.
pub fn document_id_for(owner_id: &OwnerId, display_name: &str) -> DocumentId {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(display_name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    DocumentId(format!("doc-{}", &digest[..16]))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: &DocumentId) -> Option<Document> {
        self.documents
            .read()
            .await
            .get(id)
            .map(|s| s.document.clone())
    }

    async fn list(&self, owner_id: &OwnerId) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|s| &s.document.owner_id == owner_id)
            .map(|s| s.document.clone())
            .collect();
        docs.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        docs
    }

    async fn extract_text(&self, document: &Document) -> Result<String, ExtractionError> {
        let documents = self.documents.read().await;
        let stored = documents
            .get(&document.id)
            .ok_or_else(|| ExtractionError::NotFound(document.id.to_string()))?;

        match &stored.document.extracted_text {
            Some(text) if !text.trim().is_empty() => Ok(text.clone()),
            Some(_) => Err(ExtractionError::Failed {
                document_id: document.id.to_string(),
                reason: "document contains no text".into(),
            }),
            None => Err(ExtractionError::Failed {
                document_id: document.id.to_string(),
                reason: stored
                    .failure
                    .clone()
                    .unwrap_or_else(|| "no extracted text".into()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_doc(owner: &str, id: &str, name: &str, text: &str) -> Document {
        Document {
            id: DocumentId::from(id),
            owner_id: OwnerId::from(owner),
            display_name: name.into(),
            byte_size: text.len() as u64,
            extracted_text: Some(text.into()),
        }
    }

    #[tokio::test]
    async fn extract_returns_stored_text() {
        let store = InMemoryDocumentStore::new();
        let doc = text_doc("alice", "d1", "notes.txt", "hello");
        store.insert(doc.clone()).await;
        assert_eq!(store.extract_text(&doc).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn extract_reports_failure_reason() {
        let store = InMemoryDocumentStore::new();
        let doc = text_doc("alice", "d1", "scan.pdf", "");
        store.insert_failed(doc.clone(), "scanned image, no text layer").await;

        match store.extract_text(&doc).await {
            Err(ExtractionError::Failed { reason, .. }) => {
                assert_eq!(reason, "scanned image, no text layer")
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(store.get(&doc.id).await.unwrap().extracted_text.is_none());
    }

    #[tokio::test]
    async fn whitespace_only_text_is_a_failure() {
        let store = InMemoryDocumentStore::new();
        let doc = text_doc("alice", "d1", "blank.txt", "   \n ");
        store.insert(doc.clone()).await;
        assert!(matches!(
            store.extract_text(&doc).await,
            Err(ExtractionError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let store = InMemoryDocumentStore::new();
        let doc = text_doc("alice", "ghost", "ghost.txt", "boo");
        assert!(matches!(
            store.extract_text(&doc).await,
            Err(ExtractionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_is_per_owner_and_sorted() {
        let store = InMemoryDocumentStore::new();
        store.insert(text_doc("alice", "2", "b.txt", "x")).await;
        store.insert(text_doc("alice", "1", "a.txt", "x")).await;
        store.insert(text_doc("bob", "3", "c.txt", "x")).await;

        let names: Vec<String> = store
            .list(&OwnerId::from("alice"))
            .await
            .into_iter()
            .map(|d| d.display_name)
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn insert_file_reads_text_and_flags_binary() {
        let dir = std::env::temp_dir().join(format!("quill-docs-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let text_path = dir.join("readme.md");
        let bin_path = dir.join("image.bin");
        tokio::fs::write(&text_path, "# Title\nbody").await.unwrap();
        tokio::fs::write(&bin_path, [0xffu8, 0xfe, 0x00, 0x9f]).await.unwrap();

        let store = InMemoryDocumentStore::new();
        let owner = OwnerId::from("alice");
        let readme = store.insert_file(&owner, &text_path).await.unwrap();
        let bin_doc = store.insert_file(&owner, &bin_path).await.unwrap();

        assert_eq!(readme.display_name, "readme.md");
        assert_eq!(store.extract_text(&readme).await.unwrap(), "# Title\nbody");
        assert!(store.extract_text(&bin_doc).await.is_err());
        assert_eq!(readme.id, document_id_for(&owner, "readme.md"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
