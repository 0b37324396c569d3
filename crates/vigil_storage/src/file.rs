//! File-based store for persistent storage.

use crate::error::{StorageError, StorageResult};
use crate::store::{validate_key, DurableStore};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Advisory lock file held for the lifetime of the store.
const LOCK_FILE: &str = "LOCK";
/// Extension of value files.
const VALUE_EXT: &str = "bin";
/// Extension of in-progress writes.
const TEMP_EXT: &str = "tmp";

/// A directory-backed durable store.
///
/// Each key maps to one file inside the directory (`/` in keys is encoded
/// as `~` in the file name). Writes go to a temporary file that is synced
/// and then renamed over the old value, so a crash leaves either the old or
/// the new value, never a torn one.
///
/// ```text
/// <dir>/
/// ├─ LOCK                   # Advisory lock for single-writer
/// ├─ vigil~cache.v1.bin     # Cache snapshot
/// └─ vigil~queue.v1.bin     # Offline queue
/// ```
///
/// # Thread Safety
///
/// Writers within the process are serialized by an internal mutex; the
/// `LOCK` file keeps other processes out.
///
/// # Example
///
/// ```no_run
/// use vigil_storage::{DurableStore, FileStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("vigil-data")).unwrap();
/// store.set("vigil/queue.v1", b"queued").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory and takes its exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the
    /// directory, or an I/O error if it cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        // Leftovers from a crash mid-write are never the current value.
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.extension().and_then(|e| e.to_str()) == Some(TEMP_EXT) {
                debug!(path = %entry_path.display(), "removing stale temporary file");
                fs::remove_file(&entry_path)?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(key: &str) -> String {
        format!("{}.{VALUE_EXT}", key.replace('/', "~"))
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.path.join(Self::file_name(key))
    }

    fn decode_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(&format!(".{VALUE_EXT}"))?;
        let key = stem.replace('~', "/");
        validate_key(&key).ok().map(|()| key)
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.value_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();

        let target = self.value_path(key);
        let temp = target.with_extension(format!("{VALUE_EXT}.{TEMP_EXT}"));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        debug!(key, bytes = value.len(), "stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(Self::decode_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let store = FileStore::open(&path).unwrap();
        assert!(store.keys().unwrap().is_empty());
        assert!(path.join(LOCK_FILE).exists());
    }

    #[test]
    fn file_set_and_get() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("vigil/cache.v1", b"hello world").unwrap();
        assert_eq!(
            store.get("vigil/cache.v1").unwrap(),
            Some(b"hello world".to_vec())
        );
        assert!(dir.path().join("vigil~cache.v1.bin").exists());
    }

    #[test]
    fn file_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("absent").unwrap(), None);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();

        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set("vigil/queue.v1", b"persistent data").unwrap();
        }

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(
                store.get("vigil/queue.v1").unwrap(),
                Some(b"persistent data".to_vec())
            );
            assert_eq!(store.keys().unwrap(), vec!["vigil/queue.v1"]);
        }
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStore::open(dir.path()).unwrap();
        let second = FileStore::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_remove() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("k", b"v").unwrap();
        assert!(store.remove("k").unwrap());
        assert!(!store.remove("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn file_stale_temp_files_are_cleaned() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("vigil~queue.v1.bin.tmp"), b"torn").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert!(!dir.path().join("vigil~queue.v1.bin.tmp").exists());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn file_ignores_foreign_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("a", b"1").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a"]);
    }
}
