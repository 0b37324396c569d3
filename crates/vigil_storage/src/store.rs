//! Durable store trait definition.

use crate::error::{StorageError, StorageResult};

/// Maximum length of a store key in bytes.
pub const MAX_KEY_LEN: usize = 128;

/// A durable key/value store for engine snapshots.
///
/// Stores are **opaque byte maps**. The sync engine writes whole snapshots
/// under a handful of fixed keys; stores do not understand conversations,
/// messages or queues.
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last successful `set` for a key
/// - `set` is durable when it returns `Ok`
/// - A failed `set` leaves the previous value intact
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
/// - [`super::EncryptedStore`] - Encrypting wrapper around another store
pub trait DurableStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write cannot be made
    /// durable.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// Returns true if a value was present.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Lists all keys currently present, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

impl<S: DurableStore + ?Sized> DurableStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        (**self).remove(key)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        (**self).keys()
    }
}

/// Checks that a key is usable by every store implementation.
///
/// Keys are 1..=128 bytes of ASCII letters, digits, `-`, `_`, `.` and `/`,
/// and may not start with `.` or `/`.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the first violation.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: format!("length must be 1..={MAX_KEY_LEN}"),
        });
    }
    if key.starts_with('.') || key.starts_with('/') {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: "must not start with '.' or '/'".into(),
        });
    }
    if let Some(c) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')))
    {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: format!("unsupported character {c:?}"),
        });
    }
    Ok(())
}
