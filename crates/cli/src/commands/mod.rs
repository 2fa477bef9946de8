pub mod chat;
pub mod init;
pub mod list;
pub mod show;

use std::sync::Arc;

use anyhow::Context;
use quill_config::AppConfig;
use quill_core::message::OwnerId;
use quill_security::{EncryptedConversationStore, FileConversationBackend, KeyDerivation};

/// The conversation secret, taken from `QUILL_SECRET`.
pub(crate) fn secret() -> anyhow::Result<String> {
    std::env::var("QUILL_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .context("QUILL_SECRET is not set; it unlocks your stored conversations")
}

pub(crate) fn owner() -> OwnerId {
    std::env::var("QUILL_OWNER")
        .or_else(|_| std::env::var("USER"))
        .map(OwnerId)
        .unwrap_or_else(|_| OwnerId::from("local"))
}

pub(crate) fn conversation_store(config: &AppConfig) -> EncryptedConversationStore {
    EncryptedConversationStore::new(
        Arc::new(FileConversationBackend::new(
            &config.storage.conversations_dir,
        )),
        KeyDerivation::from_config(&config.storage),
    )
}
