//! Document library: ingestion and removal across the store and the index.
//!
//! Adding a document extracts its text, chunks it and publishes the chunk
//! set. Removing a document drops its chunks as well, so retrieval never
//! returns text from a document the owner no longer has.

use std::path::Path;
use std::sync::Arc;

use quill_core::document::{Document, DocumentId, DocumentStore};
use quill_core::error::{Error, IndexError};
use quill_core::index::ChunkIndex;
use quill_core::message::OwnerId;
use tracing::{info, warn};

use crate::chunker::Chunker;
use crate::documents::InMemoryDocumentStore;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub document: Document,
    pub chunks: usize,
    /// Set when extraction failed; the document is kept without chunks.
    pub extraction_error: Option<String>,
}

pub struct Library {
    store: Arc<InMemoryDocumentStore>,
    index: Arc<dyn ChunkIndex>,
    chunker: Chunker,
}

impl Library {
    pub fn new(
        store: Arc<InMemoryDocumentStore>,
        index: Arc<dyn ChunkIndex>,
        chunker: Chunker,
    ) -> Self {
        Self {
            store,
            index,
            chunker,
        }
    }

    pub fn store(&self) -> Arc<InMemoryDocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn index(&self) -> Arc<dyn ChunkIndex> {
        Arc::clone(&self.index)
    }

    /// Store a document and (re)index its text.
    pub async fn add(&self, document: Document) -> Result<IngestReport, IndexError> {
        if document.extracted_text.is_some() {
            self.store.insert(document.clone()).await;
        } else {
            self.store
                .insert_failed(document.clone(), "no extracted text")
                .await;
        }
        self.reindex(document).await
    }

    /// Read a file from disk and ingest it.
    pub async fn add_file(&self, owner_id: &OwnerId, path: &Path) -> Result<IngestReport, Error> {
        let document = self
            .store
            .insert_file(owner_id, path)
            .await
            .map_err(|e| IndexError::Storage(format!("{}: {e}", path.display())))?;
        Ok(self.reindex(document).await?)
    }

    async fn reindex(&self, document: Document) -> Result<IngestReport, IndexError> {
        match self.store.extract_text(&document).await {
            Ok(text) => {
                let chunks = self.chunker.chunk(&document.id, &text);
                let count = chunks.len();
                self.index
                    .upsert_chunks(&document.owner_id, &document.id, chunks)
                    .await?;
                info!(
                    doc_id = %document.id,
                    name = %document.display_name,
                    chunks = count,
                    "Indexed document"
                );
                Ok(IngestReport {
                    document,
                    chunks: count,
                    extraction_error: None,
                })
            }
            Err(e) => {
                // A previously indexed version must not keep answering queries.
                self.index.remove_document(&document.id).await?;
                warn!(doc_id = %document.id, error = %e, "Document not indexed");
                Ok(IngestReport {
                    document,
                    chunks: 0,
                    extraction_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Remove a document and all of its chunks.
    pub async fn remove(&self, id: &DocumentId) -> Result<bool, IndexError> {
        let had_chunks = self.index.remove_document(id).await?;
        let had_document = self.store.remove(id).await.is_some();
        if had_document || had_chunks {
            info!(doc_id = %id, "Removed document");
        }
        Ok(had_document)
    }
}
