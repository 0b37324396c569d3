//! Push payload test vectors.
//!
//! Each vector is the JSON a push channel delivers and the event it must
//! decode to. Clients written against the same channel can share them.

use serde_json::Value;
use vigil_protocol::{
    Conversation, ConversationId, MessageId, PushEvent, PushPayload, ReadReceipt,
    Timestamp, Topic, UserId,
};

/// A JSON push payload and its expected decoding.
#[derive(Debug, Clone)]
pub struct PushVector {
    /// Unique identifier for this vector.
    pub id: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Wire JSON.
    pub json: &'static str,
    /// Expected event, or `None` if decoding must fail.
    pub expected: Option<PushEvent>,
}

impl PushVector {
    /// Decodes the vector's JSON.
    pub fn decode(&self) -> Result<PushEvent, serde_json::Error> {
        serde_json::from_str(self.json)
    }

    /// Returns the JSON as a generic value.
    pub fn value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(self.json)
    }
}

/// Push payload vectors.
pub fn push_event_vectors() -> Vec<PushVector> {
    let mut conversation = Conversation::new("c-1", "alice", "bob", Timestamp::from_millis(5));
    conversation.unread_count = 2;

    vec![
        PushVector {
            id: "read_receipt_up_to",
            description: "Read receipt with a boundary message",
            json: r#"{"topic":"conversation:c-1","type":"read_receipt","payload":{"conversation_id":"c-1","reader_id":"bob","up_to_message_id":"m-7","read_at":1700000000000}}"#,
            expected: Some(PushEvent {
                topic: Topic::Conversation(ConversationId::from("c-1")),
                payload: PushPayload::ReadReceipt(ReadReceipt {
                    conversation_id: ConversationId::from("c-1"),
                    reader_id: UserId::from("bob"),
                    up_to_message_id: Some(MessageId::from("m-7")),
                    read_at: Timestamp::from_millis(1_700_000_000_000),
                }),
            }),
        },
        PushVector {
            id: "read_receipt_all",
            description: "Read receipt without a boundary reads everything",
            json: r#"{"topic":"conversation:c-1","type":"read_receipt","payload":{"conversation_id":"c-1","reader_id":"bob","read_at":9}}"#,
            expected: Some(PushEvent {
                topic: Topic::Conversation(ConversationId::from("c-1")),
                payload: PushPayload::ReadReceipt(ReadReceipt {
                    conversation_id: ConversationId::from("c-1"),
                    reader_id: UserId::from("bob"),
                    up_to_message_id: None,
                    read_at: Timestamp::from_millis(9),
                }),
            }),
        },
        PushVector {
            id: "conversation_changed",
            description: "Conversation metadata on the user topic",
            json: r#"{"topic":"user-conversations:alice","type":"conversation","payload":{"id":"c-1","participant_ids":["alice","bob"],"prayer":{"title":"","content":"","content_type":"text"},"last_activity_at":5,"unread_count":2,"pinned":false,"archived":false}}"#,
            expected: Some(PushEvent {
                topic: Topic::UserConversations(UserId::from("alice")),
                payload: PushPayload::Conversation(conversation),
            }),
        },
        PushVector {
            id: "unknown_topic",
            description: "Topics outside the known namespaces are rejected",
            json: r#"{"topic":"presence:alice","type":"read_receipt","payload":{"conversation_id":"c-1","reader_id":"bob","read_at":9}}"#,
            expected: None,
        },
        PushVector {
            id: "unknown_type",
            description: "Unknown payload types are rejected",
            json: r#"{"topic":"conversation:c-1","type":"typing","payload":{}}"#,
            expected: None,
        },
    ]
}

/// Checks that every vector decodes as expected. Returns the ids of the
/// vectors that did not.
pub fn failing_push_vectors() -> Vec<&'static str> {
    push_event_vectors()
        .into_iter()
        .filter(|v| match (&v.expected, v.decode()) {
            (Some(expected), Ok(decoded)) => *expected != decoded,
            (None, Err(_)) => false,
            _ => true,
        })
        .map(|v| v.id)
        .collect()
}

/// Snapshot bytes that must be rejected, labelled.
pub fn invalid_snapshot_vectors() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("empty", Vec::new()),
        ("not_cbor", vec![0xff, 0x00, 0x13]),
        ("truncated_map", vec![0xa2, 0x67]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_protocol::{CacheSnapshot, QueueSnapshot};

    #[test]
    fn all_push_vectors_pass() {
        assert!(failing_push_vectors().is_empty(), "{:?}", failing_push_vectors());
    }

    #[test]
    fn vectors_have_unique_ids() {
        let vectors = push_event_vectors();
        let mut ids: Vec<_> = vectors.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), vectors.len());
    }

    #[test]
    fn decoded_events_reencode_to_same_json() {
        for vector in push_event_vectors() {
            if let Some(expected) = &vector.expected {
                let reencoded = serde_json::to_value(expected).unwrap();
                assert_eq!(reencoded, vector.value().unwrap(), "{}", vector.id);
            }
        }
    }

    #[test]
    fn invalid_snapshots_are_rejected() {
        for (id, bytes) in invalid_snapshot_vectors() {
            assert!(CacheSnapshot::decode(&bytes).is_err(), "{id}");
            assert!(QueueSnapshot::decode(&bytes).is_err(), "{id}");
        }
    }
}
