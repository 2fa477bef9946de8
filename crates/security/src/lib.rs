//! Conversation security for Quill: key derivation and encryption at rest.
//!
//! Provides:
//! - **Key derivation**: PBKDF2-HMAC-SHA256 key plus a storable verifier
//! - **Encrypted store**: AES-256-GCM sealed conversation records
//! - **Backends**: in-memory and one-file-per-conversation byte storage

pub mod backend;
pub mod kdf;
pub mod store;

pub use backend::{FileConversationBackend, InMemoryConversationBackend};
pub use kdf::{DerivedKey, KeyDerivation};
pub use store::{EncryptedBlob, EncryptedConversationStore, StoredConversation};
