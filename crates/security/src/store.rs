//! Encrypted conversation store.
//!
//! Records are serialized to JSON and sealed with AES-256-GCM under a key
//! derived from the caller's secret. The blob's metadata (version, ids,
//! KDF parameters, salt, verifier) is bound as associated data, so editing
//! any of it fails authentication just like editing the ciphertext.
//!
//! Wrong secrets are caught by the verifier before decryption is attempted.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use quill_core::error::{DecryptionError, Error, StorageError};
use quill_core::message::{ConversationId, ConversationRecord, OwnerId};
use quill_core::storage::ConversationBackend;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kdf::{DerivedKey, KeyDerivation};

pub const BLOB_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// On-disk form of a [`ConversationRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub version: u32,
    pub record_id: ConversationId,
    pub owner_id: OwnerId,
    pub kdf_iterations: u32,
    #[serde(with = "b64")]
    pub key_derivation_salt: Vec<u8>,
    #[serde(with = "b64")]
    pub verifier: Vec<u8>,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub integrity_tag: Vec<u8>,
}

/// Everything in the blob except the sealed payload; authenticated as AAD.
#[derive(Serialize)]
struct BoundMetadata<'a> {
    version: u32,
    record_id: &'a str,
    owner_id: &'a str,
    kdf_iterations: u32,
    salt: &'a [u8],
    verifier: &'a [u8],
}

impl EncryptedBlob {
    fn associated_data(
        version: u32,
        record_id: &ConversationId,
        owner_id: &OwnerId,
        kdf_iterations: u32,
        salt: &[u8],
        verifier: &[u8],
    ) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&BoundMetadata {
            version,
            record_id: record_id.as_str(),
            owner_id: owner_id.as_str(),
            kdf_iterations,
            salt,
            verifier,
        })
    }

    fn aad(&self) -> Result<Vec<u8>, serde_json::Error> {
        Self::associated_data(
            self.version,
            &self.record_id,
            &self.owner_id,
            self.kdf_iterations,
            &self.key_derivation_salt,
            &self.verifier,
        )
    }
}

/// What a backend entry decodes to. Plaintext entries predate encryption.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredConversation {
    Encrypted(EncryptedBlob),
    Plaintext(ConversationRecord),
}

impl StoredConversation {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecryptionError> {
        serde_json::from_slice(bytes)
            .map_err(|e| DecryptionError::Corrupted(format!("unrecognized entry: {e}")))
    }
}

fn unsupported_kdf(blob: &EncryptedBlob) -> String {
    format!(
        "unsupported key derivation parameters ({} iterations)",
        blob.kdf_iterations
    )
}

pub struct EncryptedConversationStore {
    backend: Arc<dyn ConversationBackend>,
    kdf: KeyDerivation,
}

impl EncryptedConversationStore {
    pub fn new(backend: Arc<dyn ConversationBackend>, kdf: KeyDerivation) -> Self {
        Self { backend, kdf }
    }

    pub fn backend(&self) -> &Arc<dyn ConversationBackend> {
        &self.backend
    }

    /// Encrypt `record`. With `existing`, its salt is reused so the same
    /// secret keeps working; a secret that does not match the existing
    /// verifier is refused rather than silently re-keying the record.
    pub fn seal(
        &self,
        record: &ConversationRecord,
        secret: &str,
        existing: Option<&EncryptedBlob>,
    ) -> Result<EncryptedBlob, Error> {
        let (kdf, key) = match existing {
            Some(prev) => {
                let kdf = self
                    .kdf
                    .for_stored(prev.kdf_iterations)
                    .ok_or_else(|| DecryptionError::Corrupted(unsupported_kdf(prev)))?;
                let key = kdf
                    .verify(secret, &prev.key_derivation_salt, &prev.verifier)?
                    .ok_or(DecryptionError::WrongSecret)?;
                (kdf, key)
            }
            None => (self.kdf, self.kdf.derive(secret, None)?),
        };
        let DerivedKey {
            key,
            salt,
            verifier,
        } = key;

        let aad = EncryptedBlob::associated_data(
            BLOB_VERSION,
            &record.id,
            &record.owner_id,
            kdf.iterations(),
            &salt,
            &verifier,
        )?;
        let plaintext = serde_json::to_vec(record)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce[..]);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StorageError::Encryption(e.to_string()))?;
        let mut ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| StorageError::Encryption(e.to_string()))?;
        let integrity_tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(EncryptedBlob {
            version: BLOB_VERSION,
            record_id: record.id.clone(),
            owner_id: record.owner_id.clone(),
            kdf_iterations: kdf.iterations(),
            key_derivation_salt: salt,
            verifier,
            nonce: nonce.to_vec(),
            ciphertext,
            integrity_tag,
        })
    }

    /// Decrypt `blob`. The verifier is checked first, so a wrong secret
    /// never reaches the cipher.
    pub fn open(
        &self,
        blob: &EncryptedBlob,
        secret: &str,
    ) -> Result<ConversationRecord, DecryptionError> {
        if blob.version != BLOB_VERSION {
            return Err(DecryptionError::Corrupted(format!(
                "unsupported blob version {}",
                blob.version
            )));
        }
        if blob.nonce.len() != NONCE_LEN || blob.integrity_tag.len() != TAG_LEN {
            return Err(DecryptionError::Corrupted(
                "nonce or tag has the wrong length".into(),
            ));
        }

        let key = self
            .kdf
            .for_stored(blob.kdf_iterations)
            .ok_or_else(|| {
                warn!(
                    conversation = %blob.record_id,
                    iterations = blob.kdf_iterations,
                    "Refusing stored key derivation parameters"
                );
                DecryptionError::Corrupted(unsupported_kdf(blob))
            })?
            .verify(secret, &blob.key_derivation_salt, &blob.verifier)
            .map_err(|e| DecryptionError::Corrupted(e.to_string()))?
            .ok_or(DecryptionError::WrongSecret)?;

        let aad = blob
            .aad()
            .map_err(|e| DecryptionError::Corrupted(e.to_string()))?;
        let mut sealed = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(&blob.ciphertext);
        sealed.extend_from_slice(&blob.integrity_tag);

        let cipher = Aes256Gcm::new_from_slice(&key.key)
            .map_err(|e| DecryptionError::Corrupted(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&blob.nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| DecryptionError::Corrupted("authentication failed".into()))?;

        let record: ConversationRecord = serde_json::from_slice(&plaintext)
            .map_err(|e| DecryptionError::Corrupted(format!("invalid record: {e}")))?;
        if record.id != blob.record_id {
            return Err(DecryptionError::Corrupted(
                "record id does not match blob".into(),
            ));
        }
        Ok(record)
    }

    /// Encrypt and persist `record`, replacing any previous version.
    pub async fn save(
        &self,
        record: &ConversationRecord,
        secret: &str,
    ) -> Result<EncryptedBlob, Error> {
        let existing = match self.backend.read(&record.id).await? {
            Some(bytes) => match StoredConversation::decode(&bytes) {
                Ok(StoredConversation::Encrypted(blob)) => Some(blob),
                Ok(StoredConversation::Plaintext(_)) => {
                    debug!(conversation = %record.id, "Encrypting previously plaintext conversation");
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let blob = self.seal(record, secret, existing.as_ref())?;
        let bytes = serde_json::to_vec(&blob)?;
        self.backend.write(&record.id, &bytes).await?;
        debug!(
            conversation = %record.id,
            backend = self.backend.name(),
            messages = record.messages.len(),
            "Conversation saved"
        );
        Ok(blob)
    }

    /// Read and decrypt a conversation. `Ok(None)` when nothing is stored.
    pub async fn load(
        &self,
        id: &ConversationId,
        secret: &str,
    ) -> Result<Option<ConversationRecord>, Error> {
        let Some(bytes) = self.backend.read(id).await? else {
            return Ok(None);
        };
        match StoredConversation::decode(&bytes)? {
            StoredConversation::Encrypted(blob) => Ok(Some(self.open(&blob, secret)?)),
            StoredConversation::Plaintext(record) => {
                warn!(
                    conversation = %id,
                    "Loaded unencrypted conversation; it will be encrypted on next save"
                );
                Ok(Some(record))
            }
        }
    }

    pub async fn delete(&self, id: &ConversationId) -> Result<bool, Error> {
        Ok(self.backend.delete(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<ConversationId>, Error> {
        Ok(self.backend.list().await?)
    }
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryConversationBackend;
    use quill_core::message::Message;

    fn store() -> EncryptedConversationStore {
        EncryptedConversationStore::new(
            Arc::new(InMemoryConversationBackend::new()),
            KeyDerivation::new(1_000),
        )
    }

    fn record() -> ConversationRecord {
        let mut rec = ConversationRecord::new(OwnerId::from("alice"), "Budget", "ollama", "llama3");
        rec.push(Message::user("What did I spend on rent?"));
        rec.push(Message::assistant("About 1200 a month."));
        rec
    }

    #[test]
    fn seal_then_open() {
        let store = store();
        let rec = record();
        let blob = store.seal(&rec, "pw", None).unwrap();

        assert_eq!(blob.nonce.len(), NONCE_LEN);
        assert_eq!(blob.integrity_tag.len(), TAG_LEN);
        assert!(!String::from_utf8_lossy(&blob.ciphertext).contains("rent"));
        assert_eq!(store.open(&blob, "pw").unwrap(), rec);
    }

    #[test]
    fn wrong_secret_is_reported_as_such() {
        let store = store();
        let blob = store.seal(&record(), "pw", None).unwrap();
        assert_eq!(
            store.open(&blob, "wrong-password").unwrap_err(),
            DecryptionError::WrongSecret
        );
    }

    #[test]
    fn flipped_ciphertext_bit_is_corruption() {
        let store = store();
        let mut blob = store.seal(&record(), "pw", None).unwrap();
        blob.ciphertext[0] ^= 0x01;
        assert!(matches!(
            store.open(&blob, "pw"),
            Err(DecryptionError::Corrupted(_))
        ));
    }

    #[test]
    fn edited_metadata_is_corruption() {
        let store = store();
        let mut blob = store.seal(&record(), "pw", None).unwrap();
        blob.owner_id = OwnerId::from("mallory");
        assert!(matches!(
            store.open(&blob, "pw"),
            Err(DecryptionError::Corrupted(_))
        ));

        let mut blob = store.seal(&record(), "pw", None).unwrap();
        blob.integrity_tag[3] ^= 0x80;
        assert!(matches!(
            store.open(&blob, "pw"),
            Err(DecryptionError::Corrupted(_))
        ));
    }

    #[test]
    fn inflated_iteration_count_is_refused_before_deriving() {
        let store = store();
        let mut blob = store.seal(&record(), "pw", None).unwrap();
        blob.kdf_iterations = 2_000_000_000;

        let started = std::time::Instant::now();
        match store.open(&blob, "pw") {
            Err(DecryptionError::Corrupted(reason)) => {
                assert!(reason.contains("key derivation"), "{reason}")
            }
            other => panic!("expected corruption, got {other:?}"),
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        blob.kdf_iterations = 0;
        assert!(matches!(
            store.open(&blob, "pw"),
            Err(DecryptionError::Corrupted(_))
        ));

        let mut existing = store.seal(&record(), "pw", None).unwrap();
        existing.kdf_iterations = u32::MAX;
        assert!(matches!(
            store.seal(&record(), "pw", Some(&existing)),
            Err(Error::Decryption(DecryptionError::Corrupted(_)))
        ));
    }

    #[test]
    fn truncated_nonce_is_corruption() {
        let store = store();
        let mut blob = store.seal(&record(), "pw", None).unwrap();
        blob.nonce.pop();
        assert!(matches!(
            store.open(&blob, "pw"),
            Err(DecryptionError::Corrupted(_))
        ));
    }

    #[test]
    fn update_reuses_salt_with_fresh_nonce() {
        let store = store();
        let mut rec = record();
        let first = store.seal(&rec, "pw", None).unwrap();
        rec.push(Message::user("And utilities?"));
        let second = store.seal(&rec, "pw", Some(&first)).unwrap();

        assert_eq!(first.key_derivation_salt, second.key_derivation_salt);
        assert_eq!(first.verifier, second.verifier);
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(store.open(&second, "pw").unwrap().messages.len(), 3);
    }

    #[test]
    fn fresh_records_get_fresh_salts() {
        let store = store();
        let a = store.seal(&record(), "pw", None).unwrap();
        let b = store.seal(&record(), "pw", None).unwrap();
        assert_ne!(a.key_derivation_salt, b.key_derivation_salt);
    }

    #[test]
    fn update_with_wrong_secret_is_refused() {
        let store = store();
        let rec = record();
        let first = store.seal(&rec, "pw", None).unwrap();
        let err = store.seal(&rec, "typo", Some(&first)).unwrap_err();
        assert!(matches!(
            err,
            Error::Decryption(DecryptionError::WrongSecret)
        ));
    }

    #[test]
    fn blob_survives_json() {
        let store = store();
        let blob = store.seal(&record(), "pw", None).unwrap();
        let json = serde_json::to_string(&blob).unwrap();
        let back: EncryptedBlob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
        assert!(matches!(
            StoredConversation::decode(json.as_bytes()).unwrap(),
            StoredConversation::Encrypted(_)
        ));
    }

    #[tokio::test]
    async fn save_and_load_through_backend() {
        let store = store();
        let rec = record();
        store.save(&rec, "pw").await.unwrap();

        let loaded = store.load(&rec.id, "pw").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(store.load(&ConversationId::from("nope"), "pw").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap(), vec![rec.id.clone()]);
    }

    #[tokio::test]
    async fn save_over_existing_keeps_salt() {
        let store = store();
        let mut rec = record();
        let first = store.save(&rec, "pw").await.unwrap();
        rec.push(Message::user("more"));
        let second = store.save(&rec, "pw").await.unwrap();
        assert_eq!(first.key_derivation_salt, second.key_derivation_salt);

        let err = store.save(&rec, "other").await.unwrap_err();
        assert!(matches!(err, Error::Decryption(DecryptionError::WrongSecret)));
        // refused save left the stored version readable
        assert_eq!(store.load(&rec.id, "pw").await.unwrap().unwrap(), rec);
    }

    #[tokio::test]
    async fn plaintext_entry_falls_back() {
        let backend = Arc::new(InMemoryConversationBackend::new());
        let rec = record();
        backend
            .write(&rec.id, &serde_json::to_vec(&rec).unwrap())
            .await
            .unwrap();
        let store = EncryptedConversationStore::new(backend, KeyDerivation::new(1_000));

        assert_eq!(store.load(&rec.id, "anything").await.unwrap().unwrap(), rec);

        // next save encrypts it
        store.save(&rec, "pw").await.unwrap();
        let bytes = store.backend().read(&rec.id).await.unwrap().unwrap();
        assert!(matches!(
            StoredConversation::decode(&bytes).unwrap(),
            StoredConversation::Encrypted(_)
        ));
    }

    #[tokio::test]
    async fn garbage_entry_is_corruption() {
        let backend = Arc::new(InMemoryConversationBackend::new());
        let id = ConversationId::from("junk");
        backend.write(&id, b"not json at all").await.unwrap();
        let store = EncryptedConversationStore::new(backend, KeyDerivation::new(1_000));

        let err = store.load(&id, "pw").await.unwrap_err();
        assert!(matches!(err, Error::Decryption(DecryptionError::Corrupted(_))));
    }

    #[tokio::test]
    async fn file_backed_store_reopens() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = record();
        let open_store = || {
            EncryptedConversationStore::new(
                Arc::new(crate::backend::FileConversationBackend::new(tmp.path())),
                KeyDerivation::new(1_000),
            )
        };
        open_store().save(&rec, "pw").await.unwrap();

        let raw = std::fs::read_to_string(tmp.path().join(format!("{}.json", rec.id))).unwrap();
        assert!(!raw.contains("rent"));
        assert_eq!(open_store().load(&rec.id, "pw").await.unwrap().unwrap(), rec);
    }
}
