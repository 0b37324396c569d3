//! Property-based test generators using proptest.
//!
//! Ids, keys and timestamps are drawn from small pools so generated
//! sequences collide often: duplicates, echoes and same-millisecond
//! messages are the interesting cases.

use crate::fixtures::HARNESS_EPOCH;
use crate::invariants::CacheOp;
use proptest::prelude::*;
use vigil_protocol::{
    ContentType, ConversationId, IdempotencyKey, Message, MessageId, MessageState, Timestamp,
    UserId,
};

/// Strategy for one of the two participants of a test conversation.
pub fn user_id_strategy() -> impl Strategy<Value = UserId> {
    prop_oneof![Just(UserId::from("alice")), Just(UserId::from("bob"))]
}

/// Strategy for message ids from a small pool.
pub fn message_id_strategy() -> impl Strategy<Value = MessageId> {
    (0u8..12).prop_map(|n| MessageId::new(format!("m-{n}")))
}

/// Strategy for optional idempotency keys from a small pool.
pub fn idempotency_key_strategy() -> impl Strategy<Value = Option<IdempotencyKey>> {
    prop::option::weighted(0.4, (0u8..6).prop_map(|n| IdempotencyKey::new(format!("K{n}"))))
}

/// Strategy for any lifecycle state.
pub fn message_state_strategy() -> impl Strategy<Value = MessageState> {
    prop_oneof![
        Just(MessageState::Pending),
        Just(MessageState::Confirmed),
        Just(MessageState::Failed),
    ]
}

/// Strategy for non-blank message text.
pub fn content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z ,.!]{0,40}").expect("Invalid regex")
}

/// Strategy for messages in `conversation`.
pub fn message_strategy(conversation: &str) -> impl Strategy<Value = Message> {
    let conversation = ConversationId::from(conversation);
    (
        message_id_strategy(),
        idempotency_key_strategy(),
        user_id_strategy(),
        content_strategy(),
        0i64..20,
        message_state_strategy(),
        prop::option::weighted(0.2, 0i64..20),
    )
        .prop_map(move |(id, key, sender, content, at, state, read)| Message {
            id,
            conversation_id: conversation.clone(),
            sender_id: sender,
            content,
            content_type: ContentType::Text,
            media_url: None,
            media_duration_seconds: None,
            created_at: Timestamp::from_millis(HARNESS_EPOCH.as_millis() + at),
            read_at: read.map(|r| Timestamp::from_millis(HARNESS_EPOCH.as_millis() + 100 + r)),
            idempotency_key: key,
            state,
        })
}

/// Strategy for a single cache mutation in `conversation`.
pub fn cache_op_strategy(conversation: &str) -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => message_strategy(conversation).prop_map(CacheOp::Insert),
        2 => message_strategy(conversation).prop_map(CacheOp::Replace),
        1 => message_strategy(conversation).prop_map(CacheOp::Remove),
        3 => message_strategy(conversation).prop_map(CacheOp::Inbound),
        2 => (0u8..6, message_strategy(conversation)).prop_map(|(n, server)| {
            CacheOp::ConfirmSend {
                key: IdempotencyKey::new(format!("K{n}")),
                server,
            }
        }),
    ]
}

/// Strategy for a sequence of cache mutations in `conversation`.
pub fn cache_ops_strategy(
    conversation: &str,
    max_len: usize,
) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(cache_op_strategy(conversation), 0..max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_messages_stay_in_conversation() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let message = message_strategy("c-1")
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert_eq!(message.conversation_id.as_str(), "c-1");
            assert!(!message.content.trim().is_empty());
        }
    }
}
