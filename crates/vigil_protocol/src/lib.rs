//! # Vigil Protocol
//!
//! Data model and wire types for the Vigil conversation sync engine.
//!
//! This crate provides:
//! - Identifier newtypes and [`Timestamp`]
//! - [`Conversation`] and [`Message`] with an explicit [`MessageState`]
//! - [`PendingAction`] for the offline queue
//! - Backend request and push event types
//! - [`CachePage`] and the persisted snapshot formats
//! - CBOR encoding/decoding of snapshots
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
pub mod codec;
mod conversation;
mod error;
mod ids;
mod message;
mod page;
mod snapshot;
mod wire;

pub use action::{ActionKind, ActionPayload, OutgoingMessage, PendingAction};
pub use conversation::{Conversation, PrayerContext};
pub use error::{CodecError, CodecResult};
pub use ids::{ConversationId, IdempotencyKey, MessageId, PrayerResponseId, Timestamp, UserId};
pub use message::{ContentType, Message, MessageState};
pub use page::CachePage;
pub use snapshot::{
    CacheSnapshot, ConversationSnapshot, QueueSnapshot, CACHE_SNAPSHOT_VERSION,
    QUEUE_SNAPSHOT_VERSION,
};
pub use wire::{
    FetchMessagesQuery, PushEvent, PushPayload, ReadReceipt, SendMessageRequest, Topic,
};
