//! Fuzz targets for the snapshot decoders and the cache.
//!
//! Usable from cargo-fuzz or any byte-driven harness. Every target must
//! return normally for every input.

use crate::invariants::check_page;
use vigil_protocol::{CacheSnapshot, QueueSnapshot};
use vigil_sync::{CacheConfig, CacheStore, EventBus};

/// Decodes arbitrary bytes as both snapshot kinds.
pub fn fuzz_snapshot_decode(data: &[u8]) {
    let _ = CacheSnapshot::decode(data);
    let _ = QueueSnapshot::decode(data);
}

/// Restores any decodable cache snapshot and checks that the restored
/// windows are sorted and unique, whatever the snapshot contained.
pub fn fuzz_cache_restore(data: &[u8]) {
    let Ok(snapshot) = CacheSnapshot::decode(data) else {
        return;
    };
    let cache = CacheStore::new(CacheConfig::default(), EventBus::new(1));
    cache.restore(snapshot);
    for row in cache.snapshot().conversations {
        assert!(check_page(&row.page).is_ok(), "restored window breaks invariants");
    }
}
