//! Collaborator interfaces.
//!
//! The engine never talks to the network directly. Backend RPC, the push
//! channel and the signed-in identity are injected through these traits,
//! so the same engine runs against a real client or the mocks in
//! [`crate::mock`].

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use vigil_protocol::{
    Conversation, ConversationId, FetchMessagesQuery, IdempotencyKey, Message, MessageId,
    PrayerResponseId, PushEvent, SendMessageRequest, Topic, UserId,
};

/// Runs a backend call under `limit`; elapsing is [`SyncError::Timeout`].
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = SyncResult<T>>,
) -> SyncResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(SyncError::Timeout))
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub display_name: String,
}

/// Supplies the signed-in user.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns the signed-in user, if any.
    async fn current_user(&self) -> Option<CurrentUser>;
}

/// Remote authoritative store for conversations and messages.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Returns the conversation for a prayer response, creating it if needed.
    async fn get_or_create_conversation(
        &self,
        prayer_response_id: &PrayerResponseId,
        user_id: &UserId,
    ) -> SyncResult<Conversation>;

    /// Creates a message. A repeated idempotency key yields
    /// [`SyncError::Conflict`](crate::SyncError::Conflict).
    async fn send_message(&self, request: &SendMessageRequest) -> SyncResult<Message>;

    /// Fetches a page of messages in any order.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        query: &FetchMessagesQuery,
    ) -> SyncResult<Vec<Message>>;

    /// Looks up a message by the key it was sent with.
    async fn message_by_idempotency_key(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
    ) -> SyncResult<Option<Message>>;

    /// Marks a conversation read for `user_id`.
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        up_to: Option<&MessageId>,
    ) -> SyncResult<()>;

    /// Lists the conversations `user_id` participates in.
    async fn list_conversations(&self, user_id: &UserId) -> SyncResult<Vec<Conversation>>;
}

/// Callback invoked for every event on a subscribed topic.
pub type PushHandler = Arc<dyn Fn(PushEvent) + Send + Sync>;

/// Identifies one push channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PushSubscriptionId(pub u64);

impl fmt::Display for PushSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Best-effort, at-most-once push delivery.
///
/// Subscribing and unsubscribing are synchronous so subscriptions can be
/// released from `Drop`.
pub trait PushChannel: Send + Sync {
    /// Opens a subscription on `topic`.
    fn subscribe(&self, topic: &Topic, handler: PushHandler) -> SyncResult<PushSubscriptionId>;

    /// Releases a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: PushSubscriptionId);
}
