//! In-process collaborators for tests and the CLI simulator.
//!
//! [`MockBackend`] behaves like an authoritative server: it assigns ids,
//! deduplicates idempotency keys and serves backward pages. Failures are
//! scripted per call kind.

use crate::clock::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    ChatBackend, CurrentUser, IdentityProvider, PushChannel, PushHandler, PushSubscriptionId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use vigil_protocol::{
    Conversation, ConversationId, FetchMessagesQuery, IdempotencyKey, Message, MessageId,
    MessageState, PrayerContext, PrayerResponseId, PushEvent, SendMessageRequest, Topic, UserId,
};

/// A failure the mock backend can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// [`SyncError::Network`].
    Network,
    /// [`SyncError::Timeout`].
    Timeout,
    /// [`SyncError::Server`].
    Server,
    /// [`SyncError::NotFound`].
    NotFound,
    /// [`SyncError::Validation`].
    Validation,
}

impl MockFailure {
    fn to_error(&self) -> SyncError {
        match self {
            MockFailure::Network => SyncError::network("connection reset by peer"),
            MockFailure::Timeout => SyncError::Timeout,
            MockFailure::Server => SyncError::Server("internal error".into()),
            MockFailure::NotFound => SyncError::NotFound("conversation".into()),
            MockFailure::Validation => SyncError::Validation("rejected by server".into()),
        }
    }
}

/// Backend operations that can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    /// `send_message`.
    Send,
    /// `fetch_messages`.
    Fetch,
    /// `mark_read`.
    MarkRead,
    /// `get_or_create_conversation` and `list_conversations`.
    Conversations,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCallCounts {
    /// `send_message` calls.
    pub send: usize,
    /// `fetch_messages` calls.
    pub fetch: usize,
    /// `mark_read` calls.
    pub mark_read: usize,
    /// `message_by_idempotency_key` calls.
    pub lookup: usize,
    /// Conversation calls.
    pub conversations: usize,
}

#[derive(Default)]
struct ServerState {
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    prayer_responses: HashMap<PrayerResponseId, (UserId, PrayerContext)>,
    failures: HashMap<MockCall, VecDeque<MockFailure>>,
    calls: MockCallCounts,
    next_message: u64,
    next_conversation: u64,
    echo_keys: bool,
}

impl ServerState {
    fn take_failure(&mut self, call: MockCall) -> Option<SyncError> {
        self.failures
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
            .map(|f| f.to_error())
    }
}

/// An in-memory authoritative backend.
pub struct MockBackend {
    state: Mutex<ServerState>,
    online: AtomicBool,
    clock: Arc<dyn Clock>,
    fetch_paused: watch::Sender<bool>,
    fetch_started: Notify,
}

impl MockBackend {
    /// Creates an empty, online backend stamping messages with wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty, online backend using `clock` for server timestamps.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (fetch_paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(ServerState {
                next_message: 1,
                next_conversation: 1,
                echo_keys: true,
                ..ServerState::default()
            }),
            online: AtomicBool::new(true),
            clock,
            fetch_paused,
            fetch_started: Notify::new(),
        }
    }

    /// Makes every call fail with a network error while `false`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns whether the backend is reachable.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Queues `count` failures for the next calls of `call`.
    pub fn fail_next(&self, call: MockCall, failure: MockFailure, count: usize) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(call).or_default();
        queue.extend(std::iter::repeat(failure).take(count));
    }

    /// Sets the numeric part of the next assigned message id (`m-<n>`).
    pub fn set_next_message_id(&self, next: u64) {
        self.state.lock().next_message = next;
    }

    /// Controls whether stored messages carry their idempotency key.
    pub fn set_echo_idempotency_keys(&self, echo: bool) {
        self.state.lock().echo_keys = echo;
    }

    /// Stores a conversation.
    pub fn insert_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock();
        state
            .messages
            .entry(conversation.id.clone())
            .or_default();
        state
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Registers a prayer response so `get_or_create_conversation` can
    /// open a conversation with `responder`.
    pub fn register_prayer_response(
        &self,
        id: PrayerResponseId,
        responder: UserId,
        prayer: PrayerContext,
    ) {
        self.state
            .lock()
            .prayer_responses
            .insert(id, (responder, prayer));
    }

    /// Stores a confirmed message as if another client had sent it.
    pub fn insert_message(&self, mut message: Message) {
        message.state = MessageState::Confirmed;
        let mut state = self.state.lock();
        if let Some(conversation) = state.conversations.get_mut(&message.conversation_id) {
            conversation.touch_activity(message.created_at);
        }
        let list = state
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        let pos = list.partition_point(|m| m.order_key() < message.order_key());
        list.insert(pos, message);
    }

    /// Returns the stored messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a stored conversation.
    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.state.lock().conversations.get(conversation_id).cloned()
    }

    /// Returns the call counters.
    pub fn calls(&self) -> MockCallCounts {
        self.state.lock().calls.clone()
    }

    /// Holds every `fetch_messages` call until [`resume_fetches`](Self::resume_fetches).
    pub fn pause_fetches(&self) {
        self.fetch_paused.send_replace(true);
    }

    /// Releases held fetches.
    pub fn resume_fetches(&self) {
        self.fetch_paused.send_replace(false);
    }

    /// Waits until a `fetch_messages` call has started.
    pub async fn fetch_started(&self) {
        self.fetch_started.notified().await;
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::network("backend unreachable"))
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("online", &self.is_online())
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

/// Sends are attributed to the conversation's first participant.
#[async_trait]
impl ChatBackend for MockBackend {
    async fn get_or_create_conversation(
        &self,
        prayer_response_id: &PrayerResponseId,
        user_id: &UserId,
    ) -> SyncResult<Conversation> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.calls.conversations += 1;
        if let Some(err) = state.take_failure(MockCall::Conversations) {
            return Err(err);
        }

        if let Some(existing) = state
            .conversations
            .values()
            .find(|c| c.prayer_response_id.as_ref() == Some(prayer_response_id))
        {
            return Ok(existing.clone());
        }

        let (responder, prayer) = state
            .prayer_responses
            .get(prayer_response_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("prayer response {prayer_response_id}")))?;
        let id = ConversationId::from(format!("c-{}", state.next_conversation));
        state.next_conversation += 1;

        let mut conversation =
            Conversation::new(id.clone(), user_id.clone(), responder, self.clock.now())
                .with_prayer(prayer);
        conversation.prayer_response_id = Some(prayer_response_id.clone());
        state.messages.entry(id.clone()).or_default();
        state.conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> SyncResult<Message> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.calls.send += 1;
        if let Some(err) = state.take_failure(MockCall::Send) {
            return Err(err);
        }
        if !state.conversations.contains_key(&request.conversation_id) {
            return Err(SyncError::NotFound(format!(
                "conversation {}",
                request.conversation_id
            )));
        }

        let list = state
            .messages
            .entry(request.conversation_id.clone())
            .or_default();
        if let Some(existing) = list
            .iter()
            .find(|m| m.idempotency_key.as_ref() == Some(&request.idempotency_key))
        {
            return Err(SyncError::conflict(existing.clone()));
        }

        let sender = state
            .conversations
            .get(&request.conversation_id)
            .map(|c| c.participant_ids[0].clone())
            .unwrap_or_else(|| UserId::from("unknown"));
        let id = MessageId::from(format!("m-{}", state.next_message));
        state.next_message += 1;
        let now = self.clock.now();
        let message = Message {
            id,
            conversation_id: request.conversation_id.clone(),
            sender_id: sender,
            content: request.content.clone(),
            content_type: request.content_type,
            media_url: request.media_url.clone(),
            media_duration_seconds: request.media_duration_seconds,
            created_at: now,
            read_at: None,
            idempotency_key: Some(request.idempotency_key.clone()),
            state: MessageState::Confirmed,
        };

        if let Some(conversation) = state.conversations.get_mut(&request.conversation_id) {
            conversation.touch_activity(now);
        }
        let echo_keys = state.echo_keys;
        state
            .messages
            .entry(request.conversation_id.clone())
            .or_default()
            .push(message.clone());

        let mut response = message;
        if !echo_keys {
            response.idempotency_key = None;
        }
        Ok(response)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        query: &FetchMessagesQuery,
    ) -> SyncResult<Vec<Message>> {
        self.check_online()?;
        {
            let mut state = self.state.lock();
            state.calls.fetch += 1;
            if let Some(err) = state.take_failure(MockCall::Fetch) {
                return Err(err);
            }
        }

        self.fetch_started.notify_one();
        let mut paused = self.fetch_paused.subscribe();
        loop {
            if !*paused.borrow_and_update() {
                break;
            }
            if paused.changed().await.is_err() {
                break;
            }
        }

        let state = self.state.lock();
        let Some(list) = state.messages.get(conversation_id) else {
            return Err(SyncError::NotFound(format!("conversation {conversation_id}")));
        };
        let end = match &query.before_id {
            Some(before) => list.iter().position(|m| &m.id == before).unwrap_or(0),
            None => list.len(),
        };
        let start = end.saturating_sub(query.limit);
        Ok(list[start..end].iter().rev().cloned().collect())
    }

    async fn message_by_idempotency_key(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
    ) -> SyncResult<Option<Message>> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.calls.lookup += 1;
        Ok(state.messages.get(conversation_id).and_then(|list| {
            list.iter()
                .find(|m| m.idempotency_key.as_ref() == Some(key))
                .cloned()
        }))
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        up_to: Option<&MessageId>,
    ) -> SyncResult<()> {
        self.check_online()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.calls.mark_read += 1;
        if let Some(err) = state.take_failure(MockCall::MarkRead) {
            return Err(err);
        }

        let Some(list) = state.messages.get_mut(conversation_id) else {
            return Err(SyncError::NotFound(format!("conversation {conversation_id}")));
        };
        let end = up_to
            .and_then(|id| list.iter().position(|m| &m.id == id))
            .map_or(list.len(), |i| i + 1);
        for message in &mut list[..end] {
            if &message.sender_id != user_id && message.read_at.is_none() {
                message.read_at = Some(now);
            }
        }
        if let Some(conversation) = state.conversations.get_mut(conversation_id) {
            conversation.unread_count = 0;
        }
        Ok(())
    }

    async fn list_conversations(&self, user_id: &UserId) -> SyncResult<Vec<Conversation>> {
        self.check_online()?;
        let mut state = self.state.lock();
        state.calls.conversations += 1;
        if let Some(err) = state.take_failure(MockCall::Conversations) {
            return Err(err);
        }
        Ok(state
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect())
    }
}

/// An in-process push channel with manual event injection.
#[derive(Default)]
pub struct MockPushChannel {
    subscriptions: Mutex<BTreeMap<PushSubscriptionId, (Topic, PushHandler)>>,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl MockPushChannel {
    /// Creates a channel with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every subscription on its topic. Returns the
    /// number of handlers invoked.
    pub fn emit(&self, event: PushEvent) -> usize {
        let handlers: Vec<PushHandler> = self
            .subscriptions
            .lock()
            .values()
            .filter(|(topic, _)| *topic == event.topic)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in &handlers {
            handler(event.clone());
        }
        handlers.len()
    }

    /// Drops every subscription, as a lost socket would.
    pub fn disconnect(&self) {
        self.subscriptions.lock().clear();
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &Topic) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|(t, _)| t == topic)
            .count()
    }

    /// Number of live subscriptions.
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Number of subscriptions ever opened.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockPushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPushChannel")
            .field("subscriptions", &self.total_subscriptions())
            .finish_non_exhaustive()
    }
}

impl PushChannel for MockPushChannel {
    fn subscribe(&self, topic: &Topic, handler: PushHandler) -> SyncResult<PushSubscriptionId> {
        let id = PushSubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .insert(id, (topic.clone(), handler));
        Ok(id)
    }

    fn unsubscribe(&self, id: PushSubscriptionId) {
        self.subscriptions.lock().remove(&id);
    }
}

/// A fixed identity.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<CurrentUser>,
}

impl StaticIdentity {
    /// Signed in as `id`.
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user: Some(CurrentUser {
                id: id.into(),
                display_name: display_name.into(),
            }),
        }
    }

    /// Nobody signed in.
    pub fn anonymous() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<CurrentUser> {
        self.user.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use vigil_protocol::{ContentType, PushPayload, Timestamp};

    fn backend() -> MockBackend {
        let backend = MockBackend::with_clock(Arc::new(ManualClock::new(Timestamp::from_millis(1_000))));
        backend.insert_conversation(Conversation::new("c-1", "alice", "bob", Timestamp::EPOCH));
        backend
    }

    fn request(key: &str) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: ConversationId::from("c-1"),
            idempotency_key: IdempotencyKey::from(key),
            content: "hello".into(),
            content_type: ContentType::Text,
            media_url: None,
            media_duration_seconds: None,
        }
    }

    #[tokio::test]
    async fn send_assigns_ids_and_dedupes_keys() {
        let backend = backend();
        backend.set_next_message_id(42);

        let sent = backend.send_message(&request("K1")).await.unwrap();
        assert_eq!(sent.id.as_str(), "m-42");
        assert_eq!(sent.created_at, Timestamp::from_millis(1_000));

        match backend.send_message(&request("K1")).await {
            Err(SyncError::Conflict { existing: Some(existing) }) => {
                assert_eq!(existing.id.as_str(), "m-42");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(backend.messages(&ConversationId::from("c-1")).len(), 1);
        assert_eq!(backend.calls().send, 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let backend = backend();
        backend.fail_next(MockCall::Send, MockFailure::Network, 2);

        assert!(backend.send_message(&request("K1")).await.is_err());
        assert!(backend.send_message(&request("K1")).await.is_err());
        assert!(backend.send_message(&request("K1")).await.is_ok());
    }

    #[tokio::test]
    async fn offline_backend_fails_everything() {
        let backend = backend();
        backend.set_online(false);
        let err = backend.send_message(&request("K1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.calls().send, 0);
    }

    #[tokio::test]
    async fn fetch_pages_backwards() {
        let backend = backend();
        let c = ConversationId::from("c-1");
        for i in 1..=5 {
            backend.insert_message(Message {
                id: MessageId::from(format!("h-{i}")),
                conversation_id: c.clone(),
                sender_id: UserId::from("bob"),
                content: format!("history {i}"),
                content_type: ContentType::Text,
                media_url: None,
                media_duration_seconds: None,
                created_at: Timestamp::from_millis(i),
                read_at: None,
                idempotency_key: None,
                state: MessageState::Confirmed,
            });
        }

        let latest = backend
            .fetch_messages(&c, &FetchMessagesQuery::latest(2))
            .await
            .unwrap();
        let ids: Vec<&str> = latest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["h-5", "h-4"]);

        let older = backend
            .fetch_messages(&c, &FetchMessagesQuery::before(10, MessageId::from("h-3")))
            .await
            .unwrap();
        let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["h-2", "h-1"]);
        assert_eq!(backend.calls().fetch, 2);
    }

    #[tokio::test]
    async fn mark_read_stamps_other_senders() {
        let backend = backend();
        let c = ConversationId::from("c-1");
        let mut inbound = backend.send_message(&request("K1")).await.unwrap();
        inbound.id = MessageId::from("m-from-bob");
        inbound.sender_id = UserId::from("bob");
        inbound.idempotency_key = None;
        backend.insert_message(inbound);

        backend
            .mark_read(&c, &UserId::from("alice"), None)
            .await
            .unwrap();
        let messages = backend.messages(&c);
        let from_bob = messages.iter().find(|m| m.sender_id.as_str() == "bob").unwrap();
        let from_alice = messages.iter().find(|m| m.sender_id.as_str() == "alice").unwrap();
        assert!(from_bob.read_at.is_some());
        assert!(from_alice.read_at.is_none());
    }

    #[tokio::test]
    async fn conversations_from_prayer_responses() {
        let backend = backend();
        let response = PrayerResponseId::from("pr-1");
        backend.register_prayer_response(response.clone(), UserId::from("bob"), PrayerContext::default());

        let first = backend
            .get_or_create_conversation(&response, &UserId::from("alice"))
            .await
            .unwrap();
        let second = backend
            .get_or_create_conversation(&response, &UserId::from("alice"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.other_participant(&UserId::from("alice")), Some(&UserId::from("bob")));

        let missing = backend
            .get_or_create_conversation(&PrayerResponseId::from("pr-9"), &UserId::from("alice"))
            .await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));
    }

    #[test]
    fn push_channel_routes_by_topic() {
        let channel = MockPushChannel::new();
        let topic = Topic::Conversation(ConversationId::from("c-1"));
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = channel
            .subscribe(
                &topic,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let event = PushEvent {
            topic: topic.clone(),
            payload: PushPayload::Conversation(Conversation::new("c-1", "a", "b", Timestamp::EPOCH)),
        };
        assert_eq!(channel.emit(event.clone()), 1);
        assert_eq!(
            channel.emit(PushEvent {
                topic: Topic::Conversation(ConversationId::from("c-2")),
                ..event.clone()
            }),
            0
        );

        channel.unsubscribe(id);
        assert_eq!(channel.emit(event), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(channel.subscription_count(&topic), 0);
    }

    #[tokio::test]
    async fn static_identity() {
        assert_eq!(
            StaticIdentity::new("alice", "Alice").current_user().await.unwrap().id,
            UserId::from("alice")
        );
        assert!(StaticIdentity::anonymous().current_user().await.is_none());
    }
}
