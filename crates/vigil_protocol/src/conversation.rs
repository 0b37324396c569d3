//! Conversations between two users.

use crate::ids::{ConversationId, PrayerResponseId, Timestamp, UserId};
use crate::message::ContentType;
use serde::{Deserialize, Serialize};

/// The prayer request a conversation grew out of, denormalized so a
/// conversation list renders without another lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrayerContext {
    /// Identifier of the prayer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prayer_id: Option<String>,
    /// Prayer title.
    pub title: String,
    /// Prayer text or caption.
    pub content: String,
    /// Kind of prayer content.
    pub content_type: ContentType,
}

/// A two-party conversation.
///
/// Created when a prayer response first occurs between two users. Never
/// hard-deleted, only archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// The two participants.
    pub participant_ids: [UserId; 2],
    /// Originating prayer.
    pub prayer: PrayerContext,
    /// Originating prayer response, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prayer_response_id: Option<PrayerResponseId>,
    /// Time of the latest message or creation.
    pub last_activity_at: Timestamp,
    /// Messages from the other participant not yet read locally.
    pub unread_count: u32,
    /// Pinned to the top of the list.
    #[serde(default)]
    pub pinned: bool,
    /// Hidden from the main list.
    #[serde(default)]
    pub archived: bool,
}

impl Conversation {
    /// Creates a conversation with no activity yet.
    pub fn new(
        id: impl Into<ConversationId>,
        first: impl Into<UserId>,
        second: impl Into<UserId>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            participant_ids: [first.into(), second.into()],
            prayer: PrayerContext::default(),
            prayer_response_id: None,
            last_activity_at: created_at,
            unread_count: 0,
            pinned: false,
            archived: false,
        }
    }

    /// Sets the prayer context.
    #[must_use]
    pub fn with_prayer(mut self, prayer: PrayerContext) -> Self {
        self.prayer = prayer;
        self
    }

    /// Returns true if `user` takes part in the conversation.
    #[must_use]
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participant_ids.contains(user)
    }

    /// Returns the participant who is not `user`.
    #[must_use]
    pub fn other_participant(&self, user: &UserId) -> Option<&UserId> {
        match &self.participant_ids {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }

    /// Advances the last-activity time, never moving it backwards.
    pub fn touch_activity(&mut self, at: Timestamp) {
        self.last_activity_at = self.last_activity_at.max(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_participant() {
        let c = Conversation::new("c-1", "alice", "bob", Timestamp::EPOCH);
        assert_eq!(c.other_participant(&"alice".into()), Some(&UserId::from("bob")));
        assert_eq!(c.other_participant(&"bob".into()), Some(&UserId::from("alice")));
        assert_eq!(c.other_participant(&"carol".into()), None);
        assert!(c.is_participant(&"bob".into()));
    }

    #[test]
    fn activity_never_moves_back() {
        let mut c = Conversation::new("c-1", "a", "b", Timestamp::from_millis(50));
        c.touch_activity(Timestamp::from_millis(10));
        assert_eq!(c.last_activity_at, Timestamp::from_millis(50));
        c.touch_activity(Timestamp::from_millis(90));
        assert_eq!(c.last_activity_at, Timestamp::from_millis(90));
    }

    #[test]
    fn flags_default_when_missing() {
        let json = r#"{
            "id": "c-1",
            "participant_ids": ["a", "b"],
            "prayer": {"title": "t", "content": "c", "content_type": "audio"},
            "last_activity_at": 5,
            "unread_count": 2
        }"#;
        let c: Conversation = serde_json::from_str(json).unwrap();
        assert!(!c.pinned);
        assert!(!c.archived);
        assert_eq!(c.prayer.content_type, ContentType::Audio);
    }
}
