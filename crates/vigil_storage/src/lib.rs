//! # Vigil Storage
//!
//! Durable key/value storage for the Vigil sync engine.
//!
//! The sync engine persists two things: a snapshot of its conversation
//! cache and the offline queue of unsent user actions. Both are opaque byte
//! blobs to this crate; stores never interpret what they hold.
//!
//! ## Design Principles
//!
//! - Stores are plain `get`/`set` byte maps keyed by short ASCII names
//! - A successful `set` is durable before it returns
//! - Must be `Send + Sync`; the engine shares one store across tasks
//! - The engine owns all format interpretation (CBOR snapshots)
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - One file per key inside a locked directory
//! - [`EncryptedStore`] - Wrapper that adds AES-256-GCM encryption at rest
//!
//! ## Example
//!
//! ```rust
//! use vigil_storage::{DurableStore, InMemoryStore};
//!
//! let store = InMemoryStore::new();
//! store.set("vigil/queue.v1", b"queued actions").unwrap();
//! assert_eq!(store.get("vigil/queue.v1").unwrap().as_deref(), Some(&b"queued actions"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encrypted;
mod error;
mod file;
mod memory;
mod store;

pub use encrypted::{EncryptedStore, EncryptionKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::{validate_key, DurableStore};
