//! Messages and their lifecycle.

use crate::ids::{ConversationId, IdempotencyKey, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of content a message (or prayer) carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Plain text.
    #[default]
    Text,
    /// Recorded audio, referenced by a media URL.
    Audio,
    /// Recorded video, referenced by a media URL.
    Video,
}

impl ContentType {
    /// Returns true for content that lives behind a media URL.
    #[must_use]
    pub fn is_media(self) -> bool {
        matches!(self, ContentType::Audio | ContentType::Video)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentType::Text => "text",
            ContentType::Audio => "audio",
            ContentType::Video => "video",
        })
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Optimistic local echo, not yet acknowledged by the server.
    Pending,
    /// Acknowledged by the server; authoritative.
    Confirmed,
    /// Permanently rejected or out of retries.
    Failed,
}

impl MessageState {
    /// Precedence used by non-downgrading merges.
    ///
    /// `Confirmed` outranks `Failed`, which outranks `Pending`.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            MessageState::Pending => 0,
            MessageState::Failed => 1,
            MessageState::Confirmed => 2,
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageState::Pending => "pending",
            MessageState::Confirmed => "confirmed",
            MessageState::Failed => "failed",
        })
    }
}

/// A message in a conversation.
///
/// Messages are ordered by [`order_key`](Self::order_key) and identified
/// within a conversation by [`slot_key`](Self::slot_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server id once confirmed; the idempotency key while pending.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text content, or a caption for media messages.
    pub content: String,
    /// Kind of content.
    pub content_type: ContentType,
    /// Location of uploaded media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Duration of uploaded media in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_duration_seconds: Option<f64>,
    /// Creation time (local clock while pending, server clock once confirmed).
    pub created_at: Timestamp,
    /// When the recipient read the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<Timestamp>,
    /// Key of the send that produced this message, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
    /// Lifecycle state.
    pub state: MessageState,
}

impl Message {
    /// Returns the sort key `(created_at, id)`.
    #[must_use]
    pub fn order_key(&self) -> (Timestamp, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Returns the key that identifies this message's slot: the
    /// idempotency key when present, otherwise the id.
    #[must_use]
    pub fn slot_key(&self) -> &str {
        self.idempotency_key
            .as_ref()
            .map_or(self.id.as_str(), IdempotencyKey::as_str)
    }

    /// Returns true if both messages occupy the same slot: they share an
    /// idempotency key, or they share an id.
    #[must_use]
    pub fn same_slot(&self, other: &Message) -> bool {
        match (&self.idempotency_key, &other.idempotency_key) {
            (Some(a), Some(b)) if a == b => true,
            _ => self.id == other.id,
        }
    }

    /// Returns true if the message matches the given slot key by
    /// idempotency key or id.
    #[must_use]
    pub fn matches_key(&self, key: &str) -> bool {
        self.id.as_str() == key
            || self
                .idempotency_key
                .as_ref()
                .is_some_and(|k| k.as_str() == key)
    }

    /// Returns true while the message awaits server acknowledgement.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }

    /// Returns true once the server has acknowledged the message.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.state == MessageState::Confirmed
    }

    /// Returns a copy in `state`.
    #[must_use]
    pub fn with_state(mut self, state: MessageState) -> Self {
        self.state = state;
        self
    }

    /// Folds fields from the copy this message replaces.
    ///
    /// Keeps an existing `read_at` and idempotency key when the incoming
    /// copy does not carry them.
    #[must_use]
    pub fn merged_over(mut self, existing: &Message) -> Self {
        if self.read_at.is_none() {
            self.read_at = existing.read_at;
        }
        if self.idempotency_key.is_none() {
            self.idempotency_key.clone_from(&existing.idempotency_key);
        }
        self
    }
}
