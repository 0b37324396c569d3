//! Queued side-effecting operations.

use crate::ids::{ConversationId, IdempotencyKey, MessageId, Timestamp, UserId};
use crate::message::{ContentType, Message, MessageState};
use crate::wire::SendMessageRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything needed to (re)issue a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Author.
    pub sender_id: UserId,
    /// Text content or caption.
    pub content: String,
    /// Kind of content.
    pub content_type: ContentType,
    /// Uploaded media location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Uploaded media duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_duration_seconds: Option<f64>,
    /// Local creation time of the optimistic echo.
    pub created_at: Timestamp,
}

/// What a queued action does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Send a message.
    SendMessage(OutgoingMessage),
    /// Mark the conversation read, up to a message or entirely.
    MarkRead {
        /// The reader.
        reader_id: UserId,
        /// Newest message read; `None` marks everything.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<MessageId>,
    },
}

/// Discriminant of [`ActionPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A send.
    SendMessage,
    /// A read marker.
    MarkRead,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::SendMessage => "send_message",
            ActionKind::MarkRead => "mark_read",
        })
    }
}

/// A side-effecting operation waiting for server confirmation.
///
/// Plain data: the whole queue is persisted and replayed after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Global enqueue order.
    pub seq: u64,
    /// Conversation the action applies to.
    pub conversation_id: ConversationId,
    /// Key identifying the logical operation across retries.
    pub idempotency_key: IdempotencyKey,
    /// The operation.
    pub payload: ActionPayload,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Earliest time of the next attempt.
    pub next_retry_at: Timestamp,
    /// Set once the action will never be attempted again.
    pub terminal: bool,
    /// When the action was accepted.
    pub enqueued_at: Timestamp,
    /// Last failure, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingAction {
    /// Creates a send action, eligible immediately.
    pub fn send(
        conversation_id: ConversationId,
        idempotency_key: IdempotencyKey,
        message: OutgoingMessage,
        now: Timestamp,
    ) -> Self {
        Self::new(
            conversation_id,
            idempotency_key,
            ActionPayload::SendMessage(message),
            now,
        )
    }

    /// Creates a mark-read action, eligible immediately.
    pub fn mark_read(
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to: Option<MessageId>,
        now: Timestamp,
    ) -> Self {
        Self::new(
            conversation_id,
            IdempotencyKey::generate(),
            ActionPayload::MarkRead { reader_id, up_to },
            now,
        )
    }

    fn new(
        conversation_id: ConversationId,
        idempotency_key: IdempotencyKey,
        payload: ActionPayload,
        now: Timestamp,
    ) -> Self {
        Self {
            seq: 0,
            conversation_id,
            idempotency_key,
            payload,
            retry_count: 0,
            next_retry_at: now,
            terminal: false,
            enqueued_at: now,
            last_error: None,
        }
    }

    /// Returns the kind of operation.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self.payload {
            ActionPayload::SendMessage(_) => ActionKind::SendMessage,
            ActionPayload::MarkRead { .. } => ActionKind::MarkRead,
        }
    }

    /// Returns true if the action may be attempted at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        !self.terminal && self.next_retry_at <= now
    }

    /// Builds the optimistic `Pending` echo of a send action.
    #[must_use]
    pub fn optimistic_message(&self) -> Option<Message> {
        match &self.payload {
            ActionPayload::SendMessage(out) => Some(Message {
                id: MessageId::from(&self.idempotency_key),
                conversation_id: self.conversation_id.clone(),
                sender_id: out.sender_id.clone(),
                content: out.content.clone(),
                content_type: out.content_type,
                media_url: out.media_url.clone(),
                media_duration_seconds: out.media_duration_seconds,
                created_at: out.created_at,
                read_at: None,
                idempotency_key: Some(self.idempotency_key.clone()),
                state: MessageState::Pending,
            }),
            ActionPayload::MarkRead { .. } => None,
        }
    }

    /// Builds the backend request for a send action.
    #[must_use]
    pub fn send_request(&self) -> Option<SendMessageRequest> {
        match &self.payload {
            ActionPayload::SendMessage(out) => Some(SendMessageRequest {
                conversation_id: self.conversation_id.clone(),
                idempotency_key: self.idempotency_key.clone(),
                content: out.content.clone(),
                content_type: out.content_type,
                media_url: out.media_url.clone(),
                media_duration_seconds: out.media_duration_seconds,
            }),
            ActionPayload::MarkRead { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> OutgoingMessage {
        OutgoingMessage {
            sender_id: UserId::from("me"),
            content: "Praying for you".into(),
            content_type: ContentType::Text,
            media_url: None,
            media_duration_seconds: None,
            created_at: Timestamp::from_millis(100),
        }
    }

    #[test]
    fn send_action_builds_pending_echo() {
        let action = PendingAction::send(
            ConversationId::from("c-1"),
            IdempotencyKey::from("K1"),
            outgoing(),
            Timestamp::from_millis(100),
        );

        let echo = action.optimistic_message().unwrap();
        assert_eq!(echo.id.as_str(), "K1");
        assert_eq!(echo.state, MessageState::Pending);
        assert_eq!(echo.content, "Praying for you");
        assert_eq!(action.kind(), ActionKind::SendMessage);

        let request = action.send_request().unwrap();
        assert_eq!(request.idempotency_key.as_str(), "K1");
        assert_eq!(request.conversation_id.as_str(), "c-1");
    }

    #[test]
    fn mark_read_has_no_echo() {
        let action = PendingAction::mark_read(
            ConversationId::from("c-1"),
            UserId::from("me"),
            None,
            Timestamp::EPOCH,
        );
        assert!(action.optimistic_message().is_none());
        assert!(action.send_request().is_none());
        assert_eq!(action.kind(), ActionKind::MarkRead);
    }

    #[test]
    fn eligibility() {
        let mut action = PendingAction::send(
            ConversationId::from("c-1"),
            IdempotencyKey::from("K1"),
            outgoing(),
            Timestamp::from_millis(100),
        );
        assert!(action.is_eligible(Timestamp::from_millis(100)));

        action.next_retry_at = Timestamp::from_millis(2_000);
        assert!(!action.is_eligible(Timestamp::from_millis(1_999)));
        assert!(action.is_eligible(Timestamp::from_millis(2_000)));

        action.terminal = true;
        assert!(!action.is_eligible(Timestamp::from_millis(5_000)));
    }

    #[test]
    fn payload_is_tagged() {
        let action = PendingAction::mark_read(
            ConversationId::from("c-1"),
            UserId::from("me"),
            Some(MessageId::from("m-9")),
            Timestamp::EPOCH,
        );
        let json = serde_json::to_value(&action.payload).unwrap();
        assert_eq!(json["type"], "mark_read");
        assert_eq!(json["up_to"], "m-9");
    }
}
