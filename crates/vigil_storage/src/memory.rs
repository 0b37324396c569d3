//! In-memory store for testing.

use crate::error::StorageResult;
use crate::store::{validate_key, DurableStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory durable store.
///
/// Nothing survives the process, so this is suitable for:
/// - Unit tests
/// - Integration tests that simulate restarts by sharing one instance
/// - Sessions that must not leave data on the device
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use vigil_storage::{DurableStore, InMemoryStore};
///
/// let store = InMemoryStore::new();
/// store.set("snapshot", b"bytes").unwrap();
/// assert_eq!(store.write_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many successful `set` calls the store has seen.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the total number of value bytes held.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl DurableStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn memory_set_and_get() {
        let store = InMemoryStore::new();
        store.set("a", b"hello").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn memory_set_overwrites() {
        let store = InMemoryStore::new();
        store.set("a", b"one").unwrap();
        store.set("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn memory_remove() {
        let store = InMemoryStore::new();
        store.set("a", b"x").unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn memory_keys_sorted() {
        let store = InMemoryStore::new();
        store.set("b", b"").unwrap();
        store.set("a", b"").unwrap();
        store.set("c/d", b"").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a", "b", "c/d"]);
    }

    #[test]
    fn memory_rejects_invalid_key() {
        let store = InMemoryStore::new();
        let result = store.set("bad key", b"x");
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }

    #[test]
    fn memory_clear() {
        let store = InMemoryStore::new();
        store.set("a", b"x").unwrap();
        store.clear();
        assert!(store.keys().unwrap().is_empty());
    }
}
