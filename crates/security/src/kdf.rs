//! Key derivation from a user secret.
//!
//! PBKDF2-HMAC-SHA256 stretches the secret and salt into 64 bytes. The first
//! half is the AES-256 key. The second half keys an HMAC over a fixed label,
//! producing the verifier: it is safe to store next to the ciphertext and
//! lets a wrong secret be rejected before any decryption is attempted.
//!
//! Keys are derived per call and never cached.

use hmac::{Hmac, Mac};
use quill_config::StorageConfig;
use quill_core::error::StorageError;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
const VERIFIER_LABEL: &[u8] = b"quill/conversation-verifier/v1";

/// Stored iteration counts are untrusted until the blob authenticates.
/// Anything up to four times the configured count is accepted, never less
/// than `STORED_ITERATIONS_FLOOR` and never more than `MAX_STORED_ITERATIONS`
/// unless the configured count itself is higher.
const STORED_ITERATIONS_FLOOR: u32 = 1_000_000;
pub const MAX_STORED_ITERATIONS: u32 = 10_000_000;

/// Output of one derivation.
#[derive(Clone)]
pub struct DerivedKey {
    pub key: [u8; KEY_LEN],
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .field("salt", &self.salt)
            .field("verifier", &self.verifier)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivation {
    iterations: u32,
}

impl KeyDerivation {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.kdf_iterations)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Derivation for an iteration count read back from storage, or `None`
    /// when the count is outside what this configuration will run.
    pub fn for_stored(&self, stored: u32) -> Option<KeyDerivation> {
        let ceiling = self
            .iterations
            .saturating_mul(4)
            .clamp(STORED_ITERATIONS_FLOOR, MAX_STORED_ITERATIONS)
            .max(self.iterations);
        (1..=ceiling)
            .contains(&stored)
            .then_some(KeyDerivation { iterations: stored })
    }

    /// Derive key and verifier. A fresh random salt is generated unless
    /// `existing_salt` is given, in which case the same secret always
    /// reproduces the same key.
    pub fn derive(
        &self,
        secret: &str,
        existing_salt: Option<&[u8]>,
    ) -> Result<DerivedKey, StorageError> {
        let salt = match existing_salt {
            Some(salt) => salt.to_vec(),
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::rng().fill(&mut salt[..]);
                salt
            }
        };

        let mut stretched = [0u8; KEY_LEN * 2];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), &salt, self.iterations, &mut stretched);

        let (key_half, mac_half) = stretched.split_at(KEY_LEN);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(key_half);

        Ok(DerivedKey {
            key,
            salt,
            verifier: verifier_mac(mac_half)?.finalize().into_bytes().to_vec(),
        })
    }

    /// Re-derive with `salt` and check the result against a stored verifier
    /// in constant time. Returns the key only on a match.
    pub fn verify(
        &self,
        secret: &str,
        salt: &[u8],
        verifier: &[u8],
    ) -> Result<Option<DerivedKey>, StorageError> {
        let mut stretched = [0u8; KEY_LEN * 2];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, self.iterations, &mut stretched);
        let (key_half, mac_half) = stretched.split_at(KEY_LEN);

        if verifier_mac(mac_half)?.verify_slice(verifier).is_err() {
            return Ok(None);
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(key_half);
        Ok(Some(DerivedKey {
            key,
            salt: salt.to_vec(),
            verifier: verifier.to_vec(),
        }))
    }
}

fn verifier_mac(mac_key: &[u8]) -> Result<HmacSha256, StorageError> {
    let mut mac = HmacSha256::new_from_slice(mac_key)
        .map_err(|e| StorageError::KeyDerivation(e.to_string()))?;
    mac.update(VERIFIER_LABEL);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdf() -> KeyDerivation {
        KeyDerivation::new(1_000)
    }

    #[test]
    fn stored_iterations_are_bounded() {
        assert_eq!(kdf().for_stored(1_000).map(|k| k.iterations()), Some(1_000));
        assert!(kdf().for_stored(900_000).is_some());
        assert!(kdf().for_stored(0).is_none());
        assert!(kdf().for_stored(2_000_000_000).is_none());

        let heavy = KeyDerivation::new(3_000_000);
        assert!(heavy.for_stored(MAX_STORED_ITERATIONS).is_some());
        assert!(heavy.for_stored(MAX_STORED_ITERATIONS + 1).is_none());

        let beyond = KeyDerivation::new(20_000_000);
        assert!(beyond.for_stored(20_000_000).is_some());
    }

    #[test]
    fn fresh_salt_each_time() {
        let a = kdf().derive("hunter2", None).unwrap();
        let b = kdf().derive("hunter2", None).unwrap();
        assert_eq!(a.salt.len(), SALT_LEN);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn same_secret_and_salt_reproduce_key() {
        let first = kdf().derive("correct horse", None).unwrap();
        let again = kdf().derive("correct horse", Some(&first.salt)).unwrap();
        assert_eq!(first.key, again.key);
        assert_eq!(first.verifier, again.verifier);
    }

    #[test]
    fn different_secret_different_key() {
        let first = kdf().derive("one", None).unwrap();
        let other = kdf().derive("two", Some(&first.salt)).unwrap();
        assert_ne!(first.key, other.key);
        assert_ne!(first.verifier, other.verifier);
    }

    #[test]
    fn verifier_does_not_expose_key() {
        let d = kdf().derive("secret", None).unwrap();
        assert_ne!(&d.verifier[..KEY_LEN], &d.key[..]);
    }

    #[test]
    fn verify_accepts_right_secret_only() {
        let d = kdf().derive("open sesame", None).unwrap();
        let ok = kdf().verify("open sesame", &d.salt, &d.verifier).unwrap();
        assert_eq!(ok.map(|k| k.key), Some(d.key));
        assert!(kdf().verify("open says me", &d.salt, &d.verifier).unwrap().is_none());
    }

    #[test]
    fn iteration_count_changes_key() {
        let d = KeyDerivation::new(1_000).derive("pw", None).unwrap();
        let e = KeyDerivation::new(1_001).derive("pw", Some(&d.salt)).unwrap();
        assert_ne!(d.key, e.key);
    }

    #[test]
    fn debug_redacts_key() {
        let d = kdf().derive("pw", None).unwrap();
        assert!(format!("{d:?}").contains("[REDACTED]"));
    }
}
