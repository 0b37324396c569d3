//! Backend requests and push events.

use crate::conversation::Conversation;
use crate::error::CodecError;
use crate::ids::{ConversationId, IdempotencyKey, MessageId, Timestamp, UserId};
use crate::message::{ContentType, Message};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Request to create a message on the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Deduplication key; a repeat must be rejected or ignored server-side.
    pub idempotency_key: IdempotencyKey,
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
}

/// Backward page query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMessagesQuery {
    /// Maximum number of messages.
    pub limit: usize,
    /// Only messages strictly older than this one; newest page when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_id: Option<MessageId>,
}

impl FetchMessagesQuery {
    /// Query for the newest page.
    #[must_use]
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            before_id: None,
        }
    }

    /// Query for the page before `id`.
    #[must_use]
    pub fn before(limit: usize, id: MessageId) -> Self {
        Self {
            limit,
            before_id: Some(id),
        }
    }
}

/// A participant read the conversation up to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Conversation read.
    pub conversation_id: ConversationId,
    /// Who read it.
    pub reader_id: UserId,
    /// Newest message read; everything when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_message_id: Option<MessageId>,
    /// When it was read.
    pub read_at: Timestamp,
}

/// A push channel topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Message and read-receipt events of one conversation.
    Conversation(ConversationId),
    /// Conversation list changes of one user.
    UserConversations(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "conversation:{id}"),
            Topic::UserConversations(id) => write!(f, "user-conversations:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("conversation", id)) if !id.is_empty() => {
                Ok(Topic::Conversation(ConversationId::from(id)))
            }
            Some(("user-conversations", id)) if !id.is_empty() => {
                Ok(Topic::UserConversations(UserId::from(id)))
            }
            _ => Err(CodecError::invalid_structure(format!("unknown topic: {s}"))),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Body of a push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushPayload {
    /// A message was created or updated.
    Message(Message),
    /// A participant read messages.
    ReadReceipt(ReadReceipt),
    /// Conversation metadata changed.
    Conversation(Conversation),
}

/// An event delivered by the push channel. At-most-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Topic the event was published on.
    pub topic: Topic,
    /// Event body.
    #[serde(flatten)]
    pub payload: PushPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_string_form() {
        let topic = Topic::Conversation(ConversationId::from("c-1"));
        assert_eq!(topic.to_string(), "conversation:c-1");
        assert_eq!("conversation:c-1".parse::<Topic>().unwrap(), topic);

        let topic = Topic::UserConversations(UserId::from("u-7"));
        assert_eq!(topic.to_string(), "user-conversations:u-7");
        assert_eq!("user-conversations:u-7".parse::<Topic>().unwrap(), topic);
    }

    #[test]
    fn bad_topics_are_rejected() {
        assert!("conversation:".parse::<Topic>().is_err());
        assert!("presence:u-1".parse::<Topic>().is_err());
        assert!("nonsense".parse::<Topic>().is_err());
    }

    #[test]
    fn push_event_json_shape() {
        let event = PushEvent {
            topic: Topic::Conversation(ConversationId::from("c-1")),
            payload: PushPayload::ReadReceipt(ReadReceipt {
                conversation_id: ConversationId::from("c-1"),
                reader_id: UserId::from("bob"),
                up_to_message_id: None,
                read_at: Timestamp::from_millis(77),
            }),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "conversation:c-1");
        assert_eq!(json["type"], "read_receipt");
        assert_eq!(json["payload"]["reader_id"], "bob");

        let back: PushEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn queries() {
        assert_eq!(FetchMessagesQuery::latest(50).before_id, None);
        let q = FetchMessagesQuery::before(50, MessageId::from("m-1"));
        assert_eq!(q.before_id.unwrap().as_str(), "m-1");
    }
}
