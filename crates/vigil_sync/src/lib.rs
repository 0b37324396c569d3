//! # Vigil Sync
//!
//! Offline-first synchronization of prayer conversations between a local
//! cache and the authoritative backend.
//!
//! This crate provides:
//! - A bounded conversation/message cache with a single mutation primitive
//! - A persistent offline queue with per-conversation FIFO and backoff
//! - Backward pagination and gap-closing refresh
//! - Push subscription management with reference-counted topics
//! - Reconciliation of optimistic sends with server-confirmed messages
//! - Mock collaborators for tests and simulation
//!
//! ## Architecture
//!
//! Every write goes through the queue, online or not:
//! 1. The optimistic `Pending` message is written to the cache
//! 2. The action is persisted and the retry worker is woken
//! 3. The backend confirms it and the resolver swaps in the server record
//!
//! Push events, pagination and confirmations all merge through
//! `CacheStore::apply_message`, so they can interleave freely.
//!
//! ## Key Invariants
//!
//! - Messages in a conversation are ordered by `(created_at, id)`
//! - At most one message per idempotency key or id
//! - A confirmed message is never replaced by a pending copy
//! - Actions of one conversation are sent strictly in enqueue order
//! - Conversations with queued actions are never evicted

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod clock;
mod config;
mod conflict;
mod engine;
mod error;
mod events;
pub mod mock;
mod paginator;
mod queue;
mod realtime;
mod transport;

pub use cache::{ApplyMode, ApplyOutcome, CacheStats, CacheStore, EvictionReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, RetryConfig, SyncConfig};
pub use conflict::{ConflictResolver, ReconcileOutcome};
pub use engine::{Collaborators, EngineStats, MediaAttachment, RestoreReport, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use paginator::Paginator;
pub use queue::{DrainReport, OfflineQueue};
pub use realtime::{
    ConversationListener, MessageListener, ReadReceiptListener, RealtimeBridge,
    SubscriptionHandle,
};
pub use transport::{
    ChatBackend, CurrentUser, IdentityProvider, PushChannel, PushHandler, PushSubscriptionId,
};
