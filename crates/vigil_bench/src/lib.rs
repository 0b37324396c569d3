//! Benchmark utilities.

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use vigil_protocol::{
    ContentType, ConversationId, IdempotencyKey, Message, MessageId, MessageState, Timestamp,
};
use vigil_sync::{ApplyMode, CacheConfig, CacheStore, EventBus};

/// Conversation every generated message belongs to.
pub const CONVERSATION: &str = "c-bench";

/// Random text of `len` characters.
pub fn random_content(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

/// A confirmed message at `at` milliseconds.
pub fn confirmed(n: usize, at: i64) -> Message {
    Message {
        id: MessageId::new(format!("m-{n:06}")),
        conversation_id: ConversationId::from(CONVERSATION),
        sender_id: "friend".into(),
        content: random_content(64),
        content_type: ContentType::Text,
        media_url: None,
        media_duration_seconds: None,
        created_at: Timestamp::from_millis(at),
        read_at: None,
        idempotency_key: None,
        state: MessageState::Confirmed,
    }
}

/// A pending echo keyed by `key`.
pub fn pending(key: &str, at: i64) -> Message {
    let key = IdempotencyKey::from(key);
    Message {
        id: MessageId::from(&key),
        sender_id: "me".into(),
        idempotency_key: Some(key),
        state: MessageState::Pending,
        ..confirmed(0, at)
    }
}

/// `count` confirmed messages, one second apart, in shuffled order.
pub fn shuffled_history(count: usize) -> Vec<Message> {
    let mut messages: Vec<Message> = (0..count)
        .map(|n| confirmed(n, n as i64 * 1_000))
        .collect();
    messages.shuffle(&mut rand::thread_rng());
    messages
}

/// A cache with room for `window` messages, pre-filled with that many.
pub fn filled_cache(window: usize) -> Arc<CacheStore> {
    let config = CacheConfig::default()
        .with_max_messages_per_conversation(window)
        .with_max_total_messages(window * 4);
    let cache = Arc::new(CacheStore::new(config, EventBus::new(16)));
    let id = ConversationId::from(CONVERSATION);
    for n in 0..window {
        cache.apply_message(&id, confirmed(n, n as i64 * 1_000), ApplyMode::Insert);
    }
    cache
}
