//! CLI command implementations.

pub mod dump_queue;
pub mod inspect;
pub mod simulate;
pub mod verify;

use std::path::Path;
use vigil_protocol::{CacheSnapshot, QueueSnapshot};
use vigil_storage::{DurableStore, FileStore};
use vigil_sync::SyncConfig;

/// Snapshots read from a store directory.
#[derive(Debug, Default)]
pub struct PersistedState {
    /// The cache, if it was ever persisted.
    pub cache: Option<CacheSnapshot>,
    /// The queue, if it was ever persisted.
    pub queue: Option<QueueSnapshot>,
}

impl PersistedState {
    /// Reads both snapshots under the default storage prefix.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.is_dir() {
            return Err(format!("No store found at {:?}", path).into());
        }
        let store = FileStore::open(path)?;
        Self::read(&store, &SyncConfig::default())
    }

    fn read(
        store: &dyn DurableStore,
        config: &SyncConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let cache = store
            .get(&config.cache_key())?
            .map(|bytes| CacheSnapshot::decode(&bytes))
            .transpose()?;
        let queue = store
            .get(&config.queue_key())?
            .map(|bytes| QueueSnapshot::decode(&bytes))
            .transpose()?;
        Ok(Self { cache, queue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(PersistedState::load(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn empty_store_has_no_snapshots() {
        let dir = TempDir::new().unwrap();
        let state = PersistedState::load(dir.path()).unwrap();
        assert!(state.cache.is_none());
        assert!(state.queue.is_none());
    }

    #[test]
    fn reads_persisted_snapshots() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::default();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store
                .set(&config.queue_key(), &QueueSnapshot::new(7, Vec::new()).encode().unwrap())
                .unwrap();
        }
        let state = PersistedState::load(dir.path()).unwrap();
        assert_eq!(state.queue.map(|q| q.next_seq), Some(7));
        assert!(state.cache.is_none());
    }
}
