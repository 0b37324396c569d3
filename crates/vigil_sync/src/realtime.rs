//! Push subscriptions and inbound event routing.
//!
//! Any number of listeners may watch a topic; the bridge keeps exactly one
//! push subscription per topic and releases it with the last listener.
//! Inbound events are merged into the cache first, and listeners hear about
//! them only when the cache actually changed.
//!
//! ## Lock order
//!
//! The topic registry lock may be held while calling into the push
//! channel. Listener callbacks always run with no bridge lock held.

use crate::cache::CacheStore;
use crate::conflict::{ConflictResolver, ReconcileOutcome};
use crate::events::{EventBus, SyncEvent};
use crate::transport::{PushChannel, PushHandler, PushSubscriptionId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};
use vigil_protocol::{
    Conversation, ConversationId, Message, PushEvent, PushPayload, ReadReceipt, Topic, UserId,
};

/// Called with each message that changed the cache.
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;
/// Called with each read receipt that stamped cached messages.
pub type ReadReceiptListener = Arc<dyn Fn(&ReadReceipt) + Send + Sync>;
/// Called with conversation metadata as merged into the cache.
pub type ConversationListener = Arc<dyn Fn(&Conversation) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Conversation {
        on_message: MessageListener,
        on_read_receipt: ReadReceiptListener,
    },
    UserConversations {
        on_change: ConversationListener,
    },
}

#[derive(Default)]
struct TopicState {
    subscription: Option<PushSubscriptionId>,
    listeners: BTreeMap<u64, Listener>,
}

struct BridgeInner {
    push: Arc<dyn PushChannel>,
    cache: Arc<CacheStore>,
    resolver: ConflictResolver,
    events: EventBus,
    local_user: RwLock<Option<UserId>>,
    topics: Mutex<HashMap<Topic, TopicState>>,
    next_listener: AtomicU64,
    suspended: AtomicBool,
}

/// Routes push events into the cache and out to listeners.
#[derive(Clone)]
pub struct RealtimeBridge {
    inner: Arc<BridgeInner>,
}

impl RealtimeBridge {
    /// Creates a bridge with no subscriptions.
    pub fn new(push: Arc<dyn PushChannel>, cache: Arc<CacheStore>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                push,
                resolver: ConflictResolver::new(Arc::clone(&cache)),
                cache,
                events,
                local_user: RwLock::new(None),
                topics: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                suspended: AtomicBool::new(false),
            }),
        }
    }

    /// Sets the signed-in user, used to tell own events from the other
    /// participant's.
    pub fn set_local_user(&self, user: Option<UserId>) {
        *self.inner.local_user.write() = user;
    }

    /// Listens for messages and read receipts in one conversation.
    pub fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_message: impl Fn(&Message) + Send + Sync + 'static,
        on_read_receipt: impl Fn(&ReadReceipt) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.listen(
            Topic::Conversation(conversation_id.clone()),
            Listener::Conversation {
                on_message: Arc::new(on_message),
                on_read_receipt: Arc::new(on_read_receipt),
            },
        )
    }

    /// Listens for metadata changes on every conversation of `user`.
    pub fn subscribe_user_conversations(
        &self,
        user: &UserId,
        on_change: impl Fn(&Conversation) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.listen(
            Topic::UserConversations(user.clone()),
            Listener::UserConversations {
                on_change: Arc::new(on_change),
            },
        )
    }

    fn listen(&self, topic: Topic, listener: Listener) -> SubscriptionHandle {
        let inner = &self.inner;
        let listener_id = inner.next_listener.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = inner.topics.lock();
            let state = topics.entry(topic.clone()).or_default();
            state.listeners.insert(listener_id, listener);
            if state.subscription.is_none() && !inner.suspended.load(Ordering::SeqCst) {
                state.subscription = inner.open(&topic);
            }
            debug!(topic = %topic, listeners = state.listeners.len(), "listener added");
        }
        SubscriptionHandle {
            bridge: Some(Arc::downgrade(inner)),
            topic,
            listener_id,
        }
    }

    /// Topics with at least one listener, sorted.
    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.inner.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of listeners on `topic`.
    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.listeners.len())
    }

    /// Releases every push subscription but keeps the listeners, so a
    /// later [`resubscribe_all`](Self::resubscribe_all) restores them.
    pub fn suspend(&self) {
        let inner = &self.inner;
        inner.suspended.store(true, Ordering::SeqCst);
        let mut topics = inner.topics.lock();
        let mut released = 0;
        for state in topics.values_mut() {
            if let Some(id) = state.subscription.take() {
                inner.push.unsubscribe(id);
                released += 1;
            }
        }
        info!(released, "suspended push subscriptions");
    }

    /// Drops whatever subscriptions are left and opens a fresh one per
    /// topic. Returns how many were opened.
    pub fn resubscribe_all(&self) -> usize {
        let inner = &self.inner;
        inner.suspended.store(false, Ordering::SeqCst);
        let mut topics = inner.topics.lock();
        let mut opened = 0;
        for (topic, state) in topics.iter_mut() {
            if let Some(stale) = state.subscription.take() {
                inner.push.unsubscribe(stale);
            }
            state.subscription = inner.open(topic);
            if state.subscription.is_some() {
                opened += 1;
            }
        }
        info!(opened, topics = topics.len(), "resubscribed push topics");
        opened
    }

    /// Processes one push event as if the channel had delivered it.
    pub fn handle_event(&self, event: PushEvent) {
        self.inner.handle_event(event);
    }
}

impl std::fmt::Debug for RealtimeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeBridge")
            .field("topics", &self.active_topics())
            .field("suspended", &self.inner.suspended.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BridgeInner {
    fn open(self: &Arc<Self>, topic: &Topic) -> Option<PushSubscriptionId> {
        let weak = Arc::downgrade(self);
        let handler: PushHandler = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        });
        match self.push.subscribe(topic, handler) {
            Ok(id) => {
                debug!(topic = %topic, subscription = %id, "push subscription opened");
                Some(id)
            }
            Err(err) => {
                warn!(topic = %topic, error = %err, "push subscribe failed");
                None
            }
        }
    }

    fn release(&self, topic: &Topic, listener_id: u64) {
        let mut topics = self.topics.lock();
        let Some(state) = topics.get_mut(topic) else {
            return;
        };
        state.listeners.remove(&listener_id);
        if !state.listeners.is_empty() {
            return;
        }
        if let Some(id) = state.subscription.take() {
            self.push.unsubscribe(id);
        }
        topics.remove(topic);
        debug!(topic = %topic, "last listener left");
    }

    fn listeners(&self, topic: &Topic) -> Vec<Listener> {
        self.topics
            .lock()
            .get(topic)
            .map(|state| state.listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    fn is_local(&self, user: &UserId) -> bool {
        self.local_user.read().as_ref() == Some(user)
    }

    fn handle_event(&self, event: PushEvent) {
        trace!(topic = %event.topic, "push event");
        match event.payload {
            PushPayload::Message(message) => self.on_message(&event.topic, message),
            PushPayload::ReadReceipt(receipt) => self.on_read_receipt(&event.topic, receipt),
            PushPayload::Conversation(conversation) => {
                self.on_conversation(&event.topic, conversation)
            }
        }
    }

    fn on_message(&self, topic: &Topic, message: Message) {
        let conversation_id = message.conversation_id.clone();
        if !carries(topic, &conversation_id) {
            warn!(topic = %topic, conversation = %conversation_id, "message on a foreign topic");
            return;
        }
        let lookup = message
            .idempotency_key
            .as_ref()
            .map_or_else(|| message.id.to_string(), ToString::to_string);
        let from_other = !self.is_local(&message.sender_id);
        let unread = from_other && message.read_at.is_none();

        let outcome = self.resolver.reconcile_inbound(&conversation_id, message);
        if outcome == ReconcileOutcome::Unchanged {
            return;
        }
        if outcome == ReconcileOutcome::Inserted && unread {
            self.cache.update_conversation(&conversation_id, |c| {
                c.unread_count = c.unread_count.saturating_add(1);
            });
        }
        let Some(cached) = self.cache.message(&conversation_id, &lookup) else {
            return;
        };

        self.events.emit(SyncEvent::MessageUpdated {
            conversation_id,
            message: cached.clone(),
        });
        for listener in self.listeners(topic) {
            if let Listener::Conversation { on_message, .. } = listener {
                on_message(&cached);
            }
        }
    }

    fn on_read_receipt(&self, topic: &Topic, receipt: ReadReceipt) {
        let conversation_id = &receipt.conversation_id;
        if !carries(topic, conversation_id) {
            warn!(topic = %topic, conversation = %conversation_id, "read receipt on a foreign topic");
            return;
        }
        if self.is_local(&receipt.reader_id) {
            // Read on another device.
            self.cache
                .update_conversation(conversation_id, |c| c.unread_count = 0);
            return;
        }

        let stamped = self.cache.stamp_read(
            conversation_id,
            &receipt.reader_id,
            receipt.up_to_message_id.as_ref(),
            receipt.read_at,
        );
        if stamped == 0 {
            return;
        }
        debug!(conversation = %conversation_id, stamped, "applied read receipt");
        self.events.emit(SyncEvent::ReadReceipt {
            receipt: receipt.clone(),
            stamped,
        });
        for listener in self.listeners(topic) {
            if let Listener::Conversation {
                on_read_receipt, ..
            } = listener
            {
                on_read_receipt(&receipt);
            }
        }
    }

    fn on_conversation(&self, topic: &Topic, conversation: Conversation) {
        let merged = self.cache.merge_remote_conversation(conversation);
        self.events
            .emit(SyncEvent::ConversationUpdated(merged.clone()));
        for listener in self.listeners(topic) {
            if let Listener::UserConversations { on_change } = listener {
                on_change(&merged);
            }
        }
    }
}

/// Whether message traffic of `conversation_id` belongs on `topic`.
fn carries(topic: &Topic, conversation_id: &ConversationId) -> bool {
    matches!(topic, Topic::Conversation(id) if id == conversation_id)
}

/// Keeps one listener registered. Dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    bridge: Option<Weak<BridgeInner>>,
    topic: Topic,
    listener_id: u64,
}

impl SubscriptionHandle {
    /// The topic listened to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Unsubscribes now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.bridge.take().and_then(|weak| weak.upgrade()) {
            inner.release(&self.topic, self.listener_id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}
