//! Conversation persistence backends: raw bytes keyed by conversation id.
//!
//! The encrypted store never sees a path or a table; it reads and writes
//! opaque bytes through [`ConversationBackend`].

use async_trait::async_trait;
use quill_core::error::StorageError;
use quill_core::message::ConversationId;
use quill_core::storage::ConversationBackend;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Volatile backend, used for tests and for sessions with persistence off.
#[derive(Default)]
pub struct InMemoryConversationBackend {
    entries: RwLock<HashMap<ConversationId, Vec<u8>>>,
}

impl InMemoryConversationBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationBackend for InMemoryConversationBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn read(&self, id: &ConversationId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn write(&self, id: &ConversationId, bytes: &[u8]) -> Result<(), StorageError> {
        self.entries.write().await.insert(id.clone(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, StorageError> {
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, StorageError> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One `<id>.json` file per conversation under a directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous version intact.
pub struct FileConversationBackend {
    dir: PathBuf,
}

impl FileConversationBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File conversation backend");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ConversationId) -> Result<PathBuf, StorageError> {
        let key = id.as_str();
        if key.is_empty()
            || key.starts_with('.')
            || key.contains(['/', '\\'])
            || key.contains("..")
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl ConversationBackend for FileConversationBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, id: &ConversationId) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn write(&self, id: &ConversationId, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create conversations directory: {e}"))
        })?;

        let tmp = self.dir.join(format!(".{}.tmp", id.as_str()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write {}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::Io(format!(
                "Failed to replace {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, StorageError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<ConversationId>, StorageError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(file = ?entry.path(), "Skipping non-UTF-8 file name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(ConversationId::from(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
