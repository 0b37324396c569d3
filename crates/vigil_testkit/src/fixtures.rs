//! Engine fixtures.
//!
//! A [`TestHarness`] owns one set of mock collaborators sharing a manual
//! clock, and builds engines against them. Engines built from the same
//! harness share the server and the durable store, which is how restart
//! scenarios are expressed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vigil_protocol::{
    ContentType, Conversation, ConversationId, Message, MessageId, MessageState, Timestamp,
    UserId,
};
use vigil_storage::{DurableStore, FileStore, InMemoryStore, StorageResult};
use vigil_sync::mock::{MockBackend, MockPushChannel, StaticIdentity};
use vigil_sync::{Collaborators, ManualClock, SyncConfig, SyncEngine};

/// Start of the manual clock used by every harness.
pub const HARNESS_EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// Mock collaborators plus the store an engine persists into.
pub struct TestHarness {
    /// Shared clock.
    pub clock: Arc<ManualClock>,
    /// The authoritative server.
    pub backend: Arc<MockBackend>,
    /// The push channel.
    pub push: Arc<MockPushChannel>,
    /// Durable storage.
    pub store: Arc<dyn DurableStore>,
    /// Configuration for built engines.
    pub config: SyncConfig,
    /// The signed-in user.
    pub user: UserId,
    temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// A harness over an in-memory store, signed in as `alice`.
    pub fn memory() -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), None)
    }

    /// A harness over a [`FileStore`] in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(&temp_dir.path().join("store"))
            .expect("Failed to open file store");
        Self::with_store(Arc::new(store), Some(temp_dir))
    }

    fn with_store(store: Arc<dyn DurableStore>, temp_dir: Option<TempDir>) -> Self {
        let clock = Arc::new(ManualClock::new(HARNESS_EPOCH));
        Self {
            backend: Arc::new(MockBackend::with_clock(clock.clone())),
            push: Arc::new(MockPushChannel::new()),
            store,
            config: SyncConfig::default().with_request_timeout(Duration::from_secs(2)),
            user: UserId::from("alice"),
            clock,
            temp_dir,
        }
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Signs in as another user.
    #[must_use]
    pub fn as_user(mut self, user: impl Into<UserId>) -> Self {
        self.user = user.into();
        self
    }

    /// Directory of the file store, if file-backed.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("store"))
    }

    /// Creates a conversation on the server between the signed-in user
    /// and `other`.
    pub fn conversation(&self, id: &str, other: &str) -> Conversation {
        let conversation = Conversation::new(id, self.user.clone(), other, HARNESS_EPOCH);
        self.backend.insert_conversation(conversation.clone());
        conversation
    }

    /// Stores a message from `sender` on the server, `offset_ms` after the
    /// harness epoch.
    pub fn server_message(
        &self,
        conversation: &str,
        id: &str,
        sender: &str,
        offset_ms: i64,
    ) -> Message {
        let message = message(conversation, id, sender, offset_ms);
        self.backend.insert_message(message.clone());
        message
    }

    /// Builds an engine that has not talked to the server yet.
    pub fn engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.config.clone(),
            Collaborators::new(
                Arc::new(StaticIdentity::new(self.user.clone(), self.user.as_str())),
                self.backend.clone(),
                self.push.clone(),
                self.store.clone(),
            )
            .with_clock(self.clock.clone()),
        )
    }

    /// Builds an engine and loads the conversation list from the server.
    pub async fn connected_engine(&self) -> SyncEngine {
        let engine = self.engine();
        engine
            .refresh_conversations()
            .await
            .expect("Failed to load conversations");
        engine
    }

    /// Reopens the file store, as a process restart would. Every engine
    /// built from this harness must be dropped first. Does nothing for an
    /// in-memory harness.
    pub fn reopen_store(&mut self) -> StorageResult<()> {
        let Some(path) = self.store_path() else {
            return Ok(());
        };
        // Release the directory lock before taking it again.
        self.store = Arc::new(InMemoryStore::new());
        self.store = Arc::new(FileStore::open(&path)?);
        Ok(())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Builds a confirmed text message `offset_ms` after the harness epoch.
pub fn message(conversation: &str, id: &str, sender: &str, offset_ms: i64) -> Message {
    Message {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        content: format!("{sender}: {id}"),
        content_type: ContentType::Text,
        media_url: None,
        media_duration_seconds: None,
        created_at: Timestamp::from_millis(HARNESS_EPOCH.as_millis() + offset_ms),
        read_at: None,
        idempotency_key: None,
        state: MessageState::Confirmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_conversation_includes_user() {
        let harness = TestHarness::memory().as_user("carol");
        let conversation = harness.conversation("c-1", "dave");
        assert!(conversation.is_participant(&UserId::from("carol")));
        assert!(harness
            .backend
            .conversation(&ConversationId::from("c-1"))
            .is_some());
    }

    #[test]
    fn file_harness_reopens() {
        let mut harness = TestHarness::file();
        harness.store.set("vigil/cache.v1", b"x").unwrap();
        harness.reopen_store().unwrap();
        assert_eq!(harness.store.get("vigil/cache.v1").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn messages_are_offset_from_epoch() {
        let m = message("c-1", "m-1", "bob", 250);
        assert_eq!(m.created_at.as_millis(), HARNESS_EPOCH.as_millis() + 250);
    }
}
