//! Ordered message windows.

use crate::ids::{ConversationId, MessageId};
use crate::message::Message;
use serde::{Deserialize, Serialize};

/// An ordered, bounded window of one conversation's messages.
///
/// Messages are sorted ascending by [`Message::order_key`]. `has_more`
/// and `oldest_loaded_id` form the backward pagination cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePage {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
    /// Whether older messages may exist on the server.
    pub has_more: bool,
    /// Oldest confirmed message id loaded so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_loaded_id: Option<MessageId>,
}

impl CachePage {
    /// Creates an empty page that assumes older history exists.
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            has_more: true,
            oldest_loaded_id: None,
        }
    }

    /// Number of messages in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the window holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Newest message, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns true if the messages are in strictly ascending order.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.messages
            .windows(2)
            .all(|w| w[0].order_key() < w[1].order_key())
    }

    /// Finds a message by id or idempotency key.
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.matches_key(key))
    }
}
