//! Conversation persistence contracts.
//!
//! [`ConversationBackend`] is raw byte storage keyed by conversation id; the
//! encrypted conversation store sits directly above it.
//! [`ConversationDirectory`] gives the context assembler read access to an
//! owner's already-opened conversations for the history relevance pass.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::message::{ConversationId, ConversationRecord, OwnerId};

/// Raw byte read/write keyed by conversation id.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self, id: &ConversationId) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the stored bytes. Must never leave a partially-written value.
    async fn write(&self, id: &ConversationId, bytes: &[u8]) -> Result<(), StorageError>;

    async fn delete(&self, id: &ConversationId) -> Result<bool, StorageError>;

    async fn list(&self) -> Result<Vec<ConversationId>, StorageError>;
}

/// Decrypted conversations visible to the current session.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn conversations(&self, owner_id: &OwnerId) -> Vec<ConversationRecord>;
}
