//! Persisted snapshot formats.
//!
//! Both snapshots are versioned and CBOR-encoded. Decoding a snapshot with
//! an unknown version fails rather than guessing at its layout.

use crate::action::PendingAction;
use crate::codec::{from_cbor, to_cbor};
use crate::conversation::Conversation;
use crate::error::{CodecError, CodecResult};
use crate::ids::ConversationId;
use crate::page::CachePage;
use serde::{Deserialize, Serialize};

/// Current cache snapshot format version.
pub const CACHE_SNAPSHOT_VERSION: u32 = 1;

/// Current queue snapshot format version.
pub const QUEUE_SNAPSHOT_VERSION: u32 = 1;

/// One cached conversation with its message window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    /// Conversation id.
    pub conversation_id: ConversationId,
    /// Metadata, if it was ever fetched.
    #[serde(default)]
    pub conversation: Option<Conversation>,
    /// Cached messages and cursor.
    pub page: CachePage,
}

/// Everything the cache holds, in least-recently-touched order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Format version.
    pub version: u32,
    /// Cached conversations.
    pub conversations: Vec<ConversationSnapshot>,
}

impl CacheSnapshot {
    /// Creates a snapshot in the current format.
    pub fn new(conversations: Vec<ConversationSnapshot>) -> Self {
        Self {
            version: CACHE_SNAPSHOT_VERSION,
            conversations,
        }
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and checks the version.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input or an unsupported version.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let snapshot: Self = from_cbor(bytes)?;
        check_version("cache", snapshot.version, CACHE_SNAPSHOT_VERSION)?;
        Ok(snapshot)
    }

    /// Total number of messages across all conversations.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.conversations.iter().map(|c| c.page.len()).sum()
    }
}

/// The offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Format version.
    pub version: u32,
    /// Next sequence number to hand out.
    pub next_seq: u64,
    /// Queued actions in enqueue order.
    pub actions: Vec<PendingAction>,
}

impl QueueSnapshot {
    /// Creates a snapshot in the current format.
    pub fn new(next_seq: u64, actions: Vec<PendingAction>) -> Self {
        Self {
            version: QUEUE_SNAPSHOT_VERSION,
            next_seq,
            actions,
        }
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and checks the version.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input, an unsupported version, or a
    /// sequence counter behind a queued action.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let snapshot: Self = from_cbor(bytes)?;
        check_version("queue", snapshot.version, QUEUE_SNAPSHOT_VERSION)?;
        if snapshot.actions.iter().any(|a| a.seq >= snapshot.next_seq) {
            return Err(CodecError::invalid_structure(
                "queued action sequence is not below next_seq",
            ));
        }
        Ok(snapshot)
    }
}

fn check_version(kind: &'static str, found: u32, expected: u32) -> CodecResult<()> {
    if found == expected {
        Ok(())
    } else {
        Err(CodecError::UnsupportedVersion {
            kind,
            found,
            expected,
        })
    }
}
