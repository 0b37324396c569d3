//! Encrypted store wrapper.
//!
//! Wraps any other [`DurableStore`] with AES-256-GCM encryption at rest.
//! Queued messages are user content, so on shared devices the snapshot
//! files should not be readable without the application key.
//!
//! ## Security Model
//!
//! - Each value is encrypted independently with a fresh random nonce
//! - Stored layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! - The key name is bound as associated data, so a value copied under
//!   another key fails authentication
//! - Keys are never stored; the application provides them

use crate::error::{StorageError, StorageResult};
use crate::store::DurableStore;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for the encrypted store.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from high-entropy secret material using HKDF-SHA256.
    ///
    /// Intended for secrets handed out by the platform keystore, not for
    /// user-chosen passwords.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive(secret: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"vigil-store-key-v1", &mut bytes)
            .map_err(|_| StorageError::encryption("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A store that encrypts every value before handing it to an inner store.
///
/// # Example
///
/// ```rust
/// use vigil_storage::{DurableStore, EncryptedStore, EncryptionKey, InMemoryStore};
///
/// let store = EncryptedStore::new(InMemoryStore::new(), EncryptionKey::generate());
/// store.set("vigil/queue.v1", b"secret").unwrap();
/// assert_eq!(store.get("vigil/queue.v1").unwrap(), Some(b"secret".to_vec()));
/// ```
pub struct EncryptedStore<S: DurableStore> {
    inner: S,
    cipher: Aes256Gcm,
}

impl<S: DurableStore> EncryptedStore<S> {
    /// Wraps `inner`, encrypting with `key`.
    pub fn new(inner: S, key: EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { inner, cipher }
    }

    /// Returns the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::encryption("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend(ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &str, stored: &[u8]) -> StorageResult<Vec<u8>> {
        if stored.len() < NONCE_SIZE + TAG_SIZE {
            return Err(StorageError::encryption("ciphertext too short"));
        }
        let nonce = Nonce::from_slice(&stored[..NONCE_SIZE]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &stored[NONCE_SIZE..],
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::encryption("authentication failed"))
    }
}

impl<S: DurableStore> DurableStore for EncryptedStore<S> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.inner.get(key)? {
            Some(stored) => self.decrypt(key, &stored).map(Some),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let stored = self.encrypt(key, value)?;
        self.inner.set(key, &stored)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        self.inner.remove(key)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys()
    }
}

impl<S: DurableStore> std::fmt::Debug for EncryptedStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("cipher", &"Aes256Gcm")
            .finish_non_exhaustive()
    }
}
