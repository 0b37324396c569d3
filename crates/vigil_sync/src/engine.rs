//! The public engine facade.
//!
//! `SyncEngine` owns one cache, one offline queue, one paginator and one
//! realtime bridge, wired to the collaborators it was built with. Several
//! engines can live in one process; they share nothing.

use crate::cache::{CacheStats, CacheStore};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::paginator::Paginator;
use crate::queue::{DrainReport, OfflineQueue};
use crate::realtime::{RealtimeBridge, SubscriptionHandle};
use crate::transport::{with_timeout, ChatBackend, CurrentUser, IdentityProvider, PushChannel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_protocol::{
    CachePage, ContentType, Conversation, ConversationId, IdempotencyKey, Message, MessageId,
    OutgoingMessage, PendingAction, PrayerResponseId, ReadReceipt,
};
use vigil_storage::DurableStore;

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Signed-in user.
    pub identity: Arc<dyn IdentityProvider>,
    /// Backend RPC.
    pub backend: Arc<dyn ChatBackend>,
    /// Push channel.
    pub push: Arc<dyn PushChannel>,
    /// Durable storage for the cache and queue snapshots.
    pub store: Arc<dyn DurableStore>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Bundles collaborators with the system clock.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        backend: Arc<dyn ChatBackend>,
        push: Arc<dyn PushChannel>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            identity,
            backend,
            push,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// An uploaded media file to attach to a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAttachment {
    /// Where the media service stored the file.
    pub url: String,
    /// Length of the recording in seconds.
    pub duration_seconds: Option<f64>,
}

impl MediaAttachment {
    /// Creates an attachment.
    pub fn new(url: impl Into<String>, duration_seconds: Option<f64>) -> Self {
        Self {
            url: url.into(),
            duration_seconds,
        }
    }
}

/// What [`SyncEngine::restore`] loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Cached messages restored.
    pub messages: usize,
    /// Queued actions restored.
    pub actions: usize,
    /// Sends re-queued for pending messages no persisted action covered.
    pub requeued: usize,
}

/// Engine occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Cache occupancy.
    pub cache: CacheStats,
    /// Queued actions.
    pub queued_actions: usize,
    /// Conversations with queued actions.
    pub pending_conversations: usize,
    /// Conversations currently open.
    pub open_conversations: usize,
    /// Topics with listeners.
    pub active_topics: usize,
    /// Whether network attempts are allowed.
    pub online: bool,
}

struct OpenConversation {
    opens: usize,
    _subscription: SubscriptionHandle,
}

/// The conversation synchronization engine.
pub struct SyncEngine {
    config: SyncConfig,
    identity: Arc<dyn IdentityProvider>,
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    cache: Arc<CacheStore>,
    queue: OfflineQueue,
    paginator: Paginator,
    realtime: RealtimeBridge,
    online: Arc<AtomicBool>,
    open: Mutex<HashMap<ConversationId, OpenConversation>>,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Creates an engine. It starts online with an empty cache; call
    /// [`restore`](Self::restore) to load persisted state and
    /// [`start`](Self::start) to run the retry worker.
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            identity,
            backend,
            push,
            store,
            clock,
        } = collaborators;
        let events = EventBus::new(config.event_capacity);
        let cache = Arc::new(CacheStore::new(config.cache.clone(), events.clone()));
        let online = Arc::new(AtomicBool::new(true));
        let queue = OfflineQueue::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            Arc::clone(&online),
        );
        let paginator = Paginator::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&backend),
            Arc::clone(&online),
        );
        let realtime = RealtimeBridge::new(push, Arc::clone(&cache), events.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            identity,
            backend,
            store,
            clock,
            events,
            cache,
            queue,
            paginator,
            realtime,
            online,
            open: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The cache, for read access and tooling.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// The offline queue.
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Subscribes to engine events.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    async fn current_user(&self) -> SyncResult<CurrentUser> {
        let user = self
            .identity
            .current_user()
            .await
            .ok_or(SyncError::NotAuthenticated)?;
        self.realtime.set_local_user(Some(user.id.clone()));
        Ok(user)
    }

    /// Tells the bridge who is signed in, so pushed messages from this
    /// user's other devices do not count as unread.
    async fn resolve_local_user(&self) {
        if let Some(user) = self.identity.current_user().await {
            self.realtime.set_local_user(Some(user.id));
        }
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if *self.shutdown.borrow() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    /// Whether network attempts are allowed.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    // --- writes ---

    /// Sends a message. Returns at once with the `Pending` message; delivery
    /// happens through the offline queue and is reported as
    /// [`SyncEvent::MessageUpdated`] or [`SyncEvent::MessageFailed`].
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotAuthenticated`] if nobody is signed in
    /// - [`SyncError::Validation`] for rejected input or a non-participant
    /// - [`SyncError::NotFound`] if the conversation is not cached
    /// - [`SyncError::Cancelled`] after [`shutdown`](Self::shutdown)
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: impl Into<String>,
        content_type: ContentType,
        media: Option<MediaAttachment>,
    ) -> SyncResult<Message> {
        self.ensure_running()?;
        let user = self.current_user().await?;
        let content = content.into();
        validate_message(&self.config, &content, content_type, media.as_ref())?;

        let conversation = self
            .cache
            .conversation(conversation_id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.is_participant(&user.id) {
            return Err(SyncError::Validation(format!(
                "{} is not a participant of {conversation_id}",
                user.id
            )));
        }

        let now = self.clock.now();
        let (media_url, media_duration_seconds) = match media {
            Some(media) => (Some(media.url), media.duration_seconds),
            None => (None, None),
        };
        let action = self.queue.enqueue(PendingAction::send(
            conversation_id.clone(),
            IdempotencyKey::generate(),
            OutgoingMessage {
                sender_id: user.id,
                content,
                content_type,
                media_url,
                media_duration_seconds,
                created_at: now,
            },
            now,
        ));

        let message = self
            .cache
            .message(conversation_id, action.idempotency_key.as_str())
            .or_else(|| action.optimistic_message())
            .ok_or_else(|| SyncError::Server("send action without a message".into()))?;
        self.events.emit(SyncEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message: message.clone(),
        });
        info!(
            conversation = %conversation_id,
            key = %action.idempotency_key,
            online = self.is_online(),
            "message queued"
        );
        Ok(message)
    }

    /// Returns the conversation for a prayer response, creating it on the
    /// server the first time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] while offline, or the backend error.
    pub async fn get_or_create_conversation(
        &self,
        prayer_response_id: &PrayerResponseId,
    ) -> SyncResult<Conversation> {
        self.ensure_running()?;
        let user = self.current_user().await?;
        self.ensure_online()?;
        let remote = with_timeout(
            self.config.request_timeout,
            self.backend
                .get_or_create_conversation(prayer_response_id, &user.id),
        )
        .await?;
        let merged = self.cache.merge_remote_conversation(remote);
        self.events
            .emit(SyncEvent::ConversationUpdated(merged.clone()));
        self.persist_cache_quietly();
        debug!(
            conversation = %merged.id,
            prayer_response = %prayer_response_id,
            "conversation ready"
        );
        Ok(merged)
    }

    /// Marks a conversation read up to `up_to` (everything when `None`).
    /// Local state changes at once; the server hears about it through the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotAuthenticated`], [`SyncError::NotFound`] or
    /// [`SyncError::Cancelled`].
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        up_to: Option<MessageId>,
    ) -> SyncResult<()> {
        self.ensure_running()?;
        let user = self.current_user().await?;
        let updated = self
            .cache
            .update_conversation(conversation_id, |c| c.unread_count = 0)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {conversation_id}")))?;
        let stamped =
            self.cache
                .stamp_read(conversation_id, &user.id, up_to.as_ref(), self.clock.now());
        self.events.emit(SyncEvent::ConversationUpdated(updated));
        self.queue.enqueue(PendingAction::mark_read(
            conversation_id.clone(),
            user.id,
            up_to,
            self.clock.now(),
        ));
        debug!(conversation = %conversation_id, stamped, "marked read");
        Ok(())
    }

    /// Re-sends a `Failed` message under its original idempotency key.
    ///
    /// # Errors
    ///
    /// See [`OfflineQueue::retry_failed`].
    pub fn retry_failed(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
    ) -> SyncResult<Message> {
        self.ensure_running()?;
        self.queue.retry_failed(conversation_id, key)
    }

    // --- reads and subscriptions ---

    /// Opens a conversation screen: keeps its topic subscribed until the
    /// matching [`close_conversation`](Self::close_conversation) and, when
    /// online, brings the newest page up to date. Returns the cached window.
    ///
    /// Transient fetch failures only log; the cached window is still
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns a fatal backend error such as [`SyncError::NotFound`].
    pub async fn open_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> SyncResult<CachePage> {
        self.resolve_local_user().await;
        {
            let mut open = self.open.lock();
            match open.get_mut(conversation_id) {
                Some(entry) => entry.opens += 1,
                None => {
                    let subscription = self.realtime.subscribe(conversation_id, |_| {}, |_| {});
                    open.insert(
                        conversation_id.clone(),
                        OpenConversation {
                            opens: 1,
                            _subscription: subscription,
                        },
                    );
                }
            }
        }
        self.cache.touch(conversation_id);

        if self.is_online() {
            let fetched = if self.cache.messages(conversation_id).is_empty() {
                self.paginator.load_older(conversation_id).await
            } else {
                self.paginator.refresh_latest(conversation_id).await
            };
            match fetched {
                Ok(count) => {
                    debug!(conversation = %conversation_id, fetched = count, "opened conversation");
                    self.persist_cache_quietly();
                }
                Err(err) if err.is_retryable() => {
                    warn!(conversation = %conversation_id, error = %err, "showing cached messages");
                }
                Err(err) => {
                    self.close_conversation(conversation_id);
                    return Err(err);
                }
            }
        }
        Ok(self.cache.messages(conversation_id))
    }

    /// Balances one [`open_conversation`](Self::open_conversation). The last
    /// close releases the topic; cached messages stay.
    pub fn close_conversation(&self, conversation_id: &ConversationId) {
        let mut open = self.open.lock();
        let Some(entry) = open.get_mut(conversation_id) else {
            return;
        };
        entry.opens -= 1;
        if entry.opens == 0 {
            open.remove(conversation_id);
            debug!(conversation = %conversation_id, "closed conversation");
        }
    }

    /// Conversations currently open, sorted.
    pub fn open_conversations(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self.open.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Listens for changes to one conversation.
    ///
    /// Telling own pushed messages from the other participant's needs the
    /// signed-in user, which any authenticated call or
    /// [`open_conversation`](Self::open_conversation) resolves.
    pub fn subscribe(
        &self,
        conversation_id: &ConversationId,
        on_message: impl Fn(&Message) + Send + Sync + 'static,
        on_read_receipt: impl Fn(&ReadReceipt) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.realtime
            .subscribe(conversation_id, on_message, on_read_receipt)
    }

    /// Listens for metadata changes on the signed-in user's conversations.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotAuthenticated`] if nobody is signed in.
    pub async fn subscribe_user_conversations(
        &self,
        on_change: impl Fn(&Conversation) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        let user = self.current_user().await?;
        Ok(self
            .realtime
            .subscribe_user_conversations(&user.id, on_change))
    }

    /// Loads the next older page. Returns how many messages it added to
    /// the cache; see [`Paginator::load_older`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] while offline, or the backend error.
    pub async fn load_older(&self, conversation_id: &ConversationId) -> SyncResult<usize> {
        self.ensure_running()?;
        let loaded = self.paginator.load_older(conversation_id).await?;
        if loaded > 0 {
            self.persist_cache_quietly();
        }
        Ok(loaded)
    }

    /// Whether older messages may exist on the server.
    pub fn has_more(&self, conversation_id: &ConversationId) -> bool {
        self.paginator.has_more(conversation_id)
    }

    /// Cached conversations in display order.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.cache.conversations()
    }

    /// A copy of a conversation's cached message window.
    pub fn messages(&self, conversation_id: &ConversationId) -> CachePage {
        self.cache.messages(conversation_id)
    }

    /// Reloads the conversation list from the server.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] while offline, or the backend error.
    pub async fn refresh_conversations(&self) -> SyncResult<Vec<Conversation>> {
        self.ensure_running()?;
        let user = self.current_user().await?;
        self.ensure_online()?;
        let remote = with_timeout(
            self.config.request_timeout,
            self.backend.list_conversations(&user.id),
        )
        .await?;
        let count = remote.len();
        for conversation in remote {
            let merged = self.cache.merge_remote_conversation(conversation);
            self.events.emit(SyncEvent::ConversationUpdated(merged));
        }
        self.persist_cache_quietly();
        debug!(conversations = count, "refreshed conversations");
        Ok(self.cache.conversations())
    }

    // --- connectivity and lifecycle ---

    /// Reacts to the host's connectivity signal.
    ///
    /// Going offline stops network attempts and suspends push. Coming
    /// online drains the queue, resubscribes every topic and refreshes the
    /// newest page of each open conversation.
    pub async fn on_connectivity_change(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            debug!(online, "connectivity unchanged");
            return;
        }
        self.queue.set_online(online);
        self.events.emit(SyncEvent::Connectivity { online });

        if !online {
            self.realtime.suspend();
            info!("went offline");
            return;
        }

        info!("back online");
        let report = self.drain().await;
        let resubscribed = self.realtime.resubscribe_all();
        let mut refreshed = 0;
        for conversation_id in self.open_conversations() {
            match self.paginator.refresh_latest(&conversation_id).await {
                Ok(count) => refreshed += count,
                Err(err) => {
                    warn!(
                        conversation = %conversation_id,
                        error = %err,
                        "refresh after reconnect failed"
                    );
                }
            }
        }
        if refreshed > 0 {
            self.persist_cache_quietly();
        }
        info!(
            drained = report.confirmed,
            resubscribed,
            refreshed,
            "caught up after reconnect"
        );
    }

    /// Attempts every eligible queued action now.
    pub async fn drain(&self) -> DrainReport {
        let report = self.queue.drain().await;
        if report.attempted > 0 {
            self.persist_cache_quietly();
        }
        report
    }

    /// Spawns the retry worker on the current tokio runtime.
    ///
    /// The worker drains on every `retry_tick` and whenever work is queued,
    /// until [`shutdown`](Self::shutdown) or the engine is dropped.
    pub fn start(&self) -> JoinHandle<()> {
        let _ = self.shutdown.send_replace(false);
        tokio::spawn(self.queue.clone().run_retry_loop(self.shutdown.subscribe()))
    }

    /// Stops the retry worker and persists state. Later writes and fetches
    /// fail with [`SyncError::Cancelled`] until [`start`](Self::start).
    pub fn shutdown(&self) {
        let _ = self.shutdown.send_replace(true);
        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist on shutdown");
        }
        info!("engine shut down");
    }

    /// Loads the persisted cache, then the persisted queue on top of it.
    /// Pending messages the queue does not cover are queued again under
    /// their own keys.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails or a snapshot cannot be decoded.
    pub fn restore(&self) -> SyncResult<RestoreReport> {
        let messages = self
            .cache
            .load(self.store.as_ref(), &self.config.cache_key())?
            .unwrap_or(0);
        let actions = self.queue.restore()?;
        let requeued = self.queue.requeue_orphans();
        Ok(RestoreReport {
            messages,
            actions,
            requeued,
        })
    }

    /// Writes the cache and queue to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub fn persist(&self) -> SyncResult<()> {
        self.cache
            .persist(self.store.as_ref(), &self.config.cache_key())?;
        self.queue.persist()
    }

    fn persist_cache_quietly(&self) {
        if let Err(err) = self
            .cache
            .persist(self.store.as_ref(), &self.config.cache_key())
        {
            warn!(error = %err, "failed to persist cache");
        }
    }

    /// Engine occupancy.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            queued_actions: self.queue.len(),
            pending_conversations: self.queue.pending_conversations().len(),
            open_conversations: self.open.lock().len(),
            active_topics: self.realtime.active_topics().len(),
            online: self.is_online(),
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("online", &self.is_online())
            .field("cache", &self.cache)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn validate_message(
    config: &SyncConfig,
    content: &str,
    content_type: ContentType,
    media: Option<&MediaAttachment>,
) -> SyncResult<()> {
    let invalid = |reason: String| Err(SyncError::Validation(reason));

    if content_type == ContentType::Text && content.trim().is_empty() {
        return invalid("message content is empty".into());
    }
    let chars = content.chars().count();
    if chars > config.max_content_chars {
        return invalid(format!(
            "message is {chars} characters, limit is {}",
            config.max_content_chars
        ));
    }

    match (content_type.is_media(), media) {
        (true, None) => invalid(format!("{content_type} messages need a media url")),
        (false, Some(_)) => invalid("media can only be attached to audio or video".into()),
        (true, Some(media)) => {
            if media.url.trim().is_empty() {
                return invalid("media url is empty".into());
            }
            match media.duration_seconds {
                Some(seconds) if !seconds.is_finite() || seconds < 0.0 => {
                    invalid(format!("invalid media duration {seconds}"))
                }
                _ => Ok(()),
            }
        }
        (false, None) => Ok(()),
    }
}
