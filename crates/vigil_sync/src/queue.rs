//! Persistent queue of side-effecting actions.
//!
//! Every send and read marker goes through the queue, online or not. The
//! queue writes the optimistic message and pins the conversation before
//! the action becomes visible to a drain, persists itself after every
//! change, and replays after a restart.
//!
//! ## Ordering
//!
//! Conversations drain concurrently, one task each. Within a conversation
//! actions run strictly in enqueue order: a head action waiting for its
//! backoff blocks the ones behind it.

use crate::cache::{ApplyMode, CacheStore};
use crate::clock::Clock;
use crate::config::{RetryConfig, SyncConfig};
use crate::conflict::{ConflictResolver, ReconcileOutcome};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::transport::{with_timeout, ChatBackend};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use vigil_protocol::{
    ActionKind, ActionPayload, ConversationId, IdempotencyKey, Message, MessageState,
    OutgoingMessage, PendingAction, QueueSnapshot,
};
use vigil_storage::DurableStore;

/// Outcome counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Backend calls made.
    pub attempted: usize,
    /// Actions that succeeded.
    pub confirmed: usize,
    /// Actions rescheduled after a transient failure.
    pub retried: usize,
    /// Actions that gave up.
    pub failed: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.confirmed += other.confirmed;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

struct QueueState {
    next_seq: u64,
    actions: BTreeMap<u64, PendingAction>,
}

impl QueueState {
    fn head(&self, conversation_id: &ConversationId) -> Option<PendingAction> {
        self.actions
            .values()
            .find(|a| &a.conversation_id == conversation_id && !a.terminal)
            .cloned()
    }
}

struct QueueInner {
    retry: RetryConfig,
    request_timeout: Duration,
    retry_tick: Duration,
    storage_key: String,
    state: Mutex<QueueState>,
    in_flight: Mutex<HashSet<ConversationId>>,
    online: Arc<AtomicBool>,
    wake: Notify,
    cache: Arc<CacheStore>,
    resolver: ConflictResolver,
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

/// Removes a conversation from the in-flight set when its drain ends.
struct InFlightGuard {
    inner: Arc<QueueInner>,
    conversation_id: ConversationId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.conversation_id);
    }
}

/// The offline queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

impl OfflineQueue {
    /// Creates an empty queue.
    pub fn new(
        config: &SyncConfig,
        cache: Arc<CacheStore>,
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        online: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                retry: config.retry.clone(),
                request_timeout: config.request_timeout,
                retry_tick: config.retry_tick,
                storage_key: config.queue_key(),
                state: Mutex::new(QueueState {
                    next_seq: 1,
                    actions: BTreeMap::new(),
                }),
                in_flight: Mutex::new(HashSet::new()),
                online,
                wake: Notify::new(),
                resolver: ConflictResolver::new(Arc::clone(&cache)),
                cache,
                backend,
                store,
                clock,
                events,
            }),
        }
    }

    /// Accepts an action. Sends write their `Pending` message first; a
    /// mark-read that has not been attempted yet absorbs a newer one.
    ///
    /// Returns the action as queued.
    pub fn enqueue(&self, mut action: PendingAction) -> PendingAction {
        let inner = &self.inner;
        let conversation_id = action.conversation_id.clone();

        if let Some(coalesced) = self.coalesce_mark_read(&action) {
            debug!(conversation = %conversation_id, seq = coalesced.seq, "coalesced mark-read");
            inner.persist_quietly();
            return coalesced;
        }

        // Pinned first: the insert below may run an eviction pass.
        inner.cache.pin(&conversation_id);
        if let Some(message) = action.optimistic_message() {
            inner
                .cache
                .apply_message(&conversation_id, message, ApplyMode::Insert);
        }

        {
            let mut state = inner.state.lock();
            action.seq = state.next_seq;
            state.next_seq += 1;
            state.actions.insert(action.seq, action.clone());
        }
        debug!(
            conversation = %conversation_id,
            key = %action.idempotency_key,
            seq = action.seq,
            kind = %action.kind(),
            "enqueued action"
        );

        inner.persist_quietly();
        inner.wake.notify_one();
        action
    }

    fn coalesce_mark_read(&self, action: &PendingAction) -> Option<PendingAction> {
        let ActionPayload::MarkRead { up_to, .. } = &action.payload else {
            return None;
        };
        let mut state = self.inner.state.lock();
        if self
            .inner
            .in_flight
            .lock()
            .contains(&action.conversation_id)
        {
            return None;
        }
        let existing = state.actions.values_mut().find(|a| {
            a.conversation_id == action.conversation_id
                && a.kind() == ActionKind::MarkRead
                && a.retry_count == 0
                && !a.terminal
        })?;
        if let ActionPayload::MarkRead {
            up_to: existing_up_to,
            ..
        } = &mut existing.payload
        {
            *existing_up_to = match (existing_up_to.take(), up_to) {
                (None, _) | (_, None) => None,
                (Some(_), Some(newer)) => Some(newer.clone()),
            };
        }
        Some(existing.clone())
    }

    /// Attempts every eligible action now. Does nothing while offline.
    pub async fn drain(&self) -> DrainReport {
        let inner = &self.inner;
        if !inner.is_online() {
            return DrainReport::default();
        }

        let now = inner.clock.now();
        let candidates: BTreeSet<ConversationId> = inner
            .state
            .lock()
            .actions
            .values()
            .filter(|a| a.is_eligible(now))
            .map(|a| a.conversation_id.clone())
            .collect();
        let claimed: Vec<ConversationId> = {
            let mut in_flight = inner.in_flight.lock();
            candidates
                .into_iter()
                .filter(|c| in_flight.insert(c.clone()))
                .collect()
        };

        let mut tasks = JoinSet::new();
        for conversation_id in claimed {
            let inner = Arc::clone(inner);
            tasks.spawn(async move {
                let guard = InFlightGuard {
                    inner: Arc::clone(&inner),
                    conversation_id: conversation_id.clone(),
                };
                let report = inner.drain_conversation(&conversation_id).await;
                drop(guard);
                report
            });
        }

        let mut report = DrainReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(conversation_report) => report.absorb(conversation_report),
                Err(err) => warn!(error = %err, "drain task failed"),
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                confirmed = report.confirmed,
                retried = report.retried,
                failed = report.failed,
                "drained offline queue"
            );
        }
        report
    }

    /// Drains on every tick and on every enqueue until `shutdown` turns true.
    pub async fn run_retry_loop(self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        let mut ticker = interval(self.inner.retry_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("retry loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.inner.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.drain().await;
        }
        info!("retry loop stopped");
    }

    /// Records connectivity. Coming online wakes the retry loop.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if online {
            self.inner.wake.notify_one();
        }
    }

    /// Returns whether network attempts are allowed.
    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    /// Returns queued actions in enqueue order.
    pub fn pending(&self) -> Vec<PendingAction> {
        self.inner.state.lock().actions.values().cloned().collect()
    }

    /// Returns the queued actions of one conversation.
    pub fn pending_for(&self, conversation_id: &ConversationId) -> Vec<PendingAction> {
        self.inner
            .state
            .lock()
            .actions
            .values()
            .filter(|a| &a.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Returns conversations with queued work.
    pub fn pending_conversations(&self) -> Vec<ConversationId> {
        let set: BTreeSet<ConversationId> = self
            .inner
            .state
            .lock()
            .actions
            .values()
            .map(|a| a.conversation_id.clone())
            .collect();
        set.into_iter().collect()
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.inner.state.lock().actions.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-sends a failed message under its original idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the message is not cached and
    /// [`SyncError::Validation`] if it is not in the `Failed` state.
    pub fn retry_failed(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
    ) -> SyncResult<Message> {
        let inner = &self.inner;
        let message = inner
            .cache
            .message(conversation_id, key.as_str())
            .ok_or_else(|| SyncError::NotFound(format!("message {key}")))?;
        if message.state != MessageState::Failed {
            return Err(SyncError::Validation(format!(
                "message {key} is {}, only failed messages can be retried",
                message.state
            )));
        }

        let outgoing = outgoing_from(&message);
        let pending = inner
            .resolver
            .reset_to_pending(conversation_id, key)
            .ok_or_else(|| SyncError::NotFound(format!("message {key}")))?;
        inner.events.emit(SyncEvent::MessageUpdated {
            conversation_id: conversation_id.clone(),
            message: pending.clone(),
        });
        self.enqueue(PendingAction::send(
            conversation_id.clone(),
            key.clone(),
            outgoing,
            inner.clock.now(),
        ));
        info!(conversation = %conversation_id, key = %key, "retrying failed message");
        Ok(pending)
    }

    /// Queues a send for every cached `Pending` message that no action
    /// covers, under the message's own idempotency key. Returns how many
    /// were queued.
    ///
    /// Run after [`restore`](Self::restore): a crash between the queue and
    /// cache writes can leave such a message behind. If the server already
    /// has it, the send resolves through the conflict path.
    pub fn requeue_orphans(&self) -> usize {
        let inner = &self.inner;
        let covered: HashSet<IdempotencyKey> = inner
            .state
            .lock()
            .actions
            .values()
            .map(|a| a.idempotency_key.clone())
            .collect();

        let mut requeued = 0;
        for message in inner.cache.pending_messages() {
            let Some(key) = message.idempotency_key.clone() else {
                continue;
            };
            if covered.contains(&key) {
                continue;
            }
            let conversation_id = message.conversation_id.clone();
            warn!(conversation = %conversation_id, key = %key, "requeueing orphaned send");
            self.enqueue(PendingAction::send(
                conversation_id,
                key,
                outgoing_from(&message),
                inner.clock.now(),
            ));
            requeued += 1;
        }
        requeued
    }

    /// Writes the queue to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub fn persist(&self) -> SyncResult<()> {
        self.inner.persist()
    }

    /// Loads the persisted queue, re-creating pending messages and pins.
    /// Returns the number of restored actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the snapshot cannot be decoded.
    pub fn restore(&self) -> SyncResult<usize> {
        let inner = &self.inner;
        let Some(bytes) = inner.store.get(&inner.storage_key)? else {
            return Ok(0);
        };
        let snapshot = QueueSnapshot::decode(&bytes)?;

        let mut restored = 0;
        for action in snapshot.actions {
            let known = inner
                .state
                .lock()
                .actions
                .values()
                .any(|a| a.idempotency_key == action.idempotency_key);
            if known {
                continue;
            }
            inner.cache.pin(&action.conversation_id);
            if let Some(message) = action.optimistic_message() {
                inner
                    .cache
                    .apply_message(&action.conversation_id, message, ApplyMode::Insert);
            }
            let mut state = inner.state.lock();
            state.next_seq = state.next_seq.max(action.seq + 1);
            state.actions.insert(action.seq, action);
            restored += 1;
        }
        {
            let mut state = inner.state.lock();
            state.next_seq = state.next_seq.max(snapshot.next_seq);
        }
        info!(actions = restored, "restored offline queue");
        if restored > 0 {
            inner.wake.notify_one();
        }
        Ok(restored)
    }
}

fn outgoing_from(message: &Message) -> OutgoingMessage {
    OutgoingMessage {
        sender_id: message.sender_id.clone(),
        content: message.content.clone(),
        content_type: message.content_type,
        media_url: message.media_url.clone(),
        media_duration_seconds: message.media_duration_seconds,
        created_at: message.created_at,
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn drain_conversation(&self, conversation_id: &ConversationId) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            if !self.is_online() {
                break;
            }
            let Some(action) = self.state.lock().head(conversation_id) else {
                break;
            };
            if !action.is_eligible(self.clock.now()) {
                break;
            }

            report.attempted += 1;
            match self.attempt(&action).await {
                Ok(()) => {
                    self.resolve(&action);
                    report.confirmed += 1;
                }
                Err(err) if err.is_retryable() => {
                    if self.schedule_retry(&action, &err) {
                        report.retried += 1;
                        break;
                    }
                    report.failed += 1;
                }
                Err(err) => {
                    self.give_up(&action, &err.to_string());
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn timed<T>(&self, call: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        with_timeout(self.request_timeout, call).await
    }

    async fn attempt(&self, action: &PendingAction) -> SyncResult<()> {
        let conversation_id = &action.conversation_id;
        let key = &action.idempotency_key;
        match &action.payload {
            ActionPayload::SendMessage(_) => {
                let Some(request) = action.send_request() else {
                    return Ok(());
                };
                let confirmed = match self.timed(self.backend.send_message(&request)).await
                {
                    Ok(message) => message,
                    Err(SyncError::Conflict {
                        existing: Some(existing),
                    }) => *existing,
                    Err(SyncError::Conflict { existing: None }) => self
                        .timed(self.backend.message_by_idempotency_key(conversation_id, key))
                        .await?
                        .ok_or_else(|| {
                            SyncError::Server(format!("key {key} conflicts but has no record"))
                        })?,
                    Err(err) => return Err(err),
                };

                let outcome = self.resolver.reconcile_send(conversation_id, key, confirmed);
                if outcome != ReconcileOutcome::Unchanged {
                    if let Some(message) = self.cache.message(conversation_id, key.as_str()) {
                        self.events.emit(SyncEvent::MessageUpdated {
                            conversation_id: conversation_id.clone(),
                            message,
                        });
                    }
                }
                Ok(())
            }
            ActionPayload::MarkRead { reader_id, up_to } => {
                self.timed(
                    self.backend
                        .mark_read(conversation_id, reader_id, up_to.as_ref()),
                )
                .await
            }
        }
    }

    fn remove(&self, action: &PendingAction) -> bool {
        let removed = self.state.lock().actions.remove(&action.seq).is_some();
        if removed {
            self.cache.unpin(&action.conversation_id);
        }
        removed
    }

    fn resolve(&self, action: &PendingAction) {
        if self.remove(action) {
            debug!(
                conversation = %action.conversation_id,
                key = %action.idempotency_key,
                seq = action.seq,
                "action confirmed"
            );
            self.persist_quietly();
        }
    }

    /// Records a transient failure. Returns false once the retry budget is
    /// spent and the action has been given up.
    fn schedule_retry(&self, action: &PendingAction, err: &SyncError) -> bool {
        let now = self.clock.now();
        let retry_count = {
            let mut state = self.state.lock();
            let Some(queued) = state.actions.get_mut(&action.seq) else {
                return true;
            };
            queued.retry_count += 1;
            queued.last_error = Some(err.to_string());
            if !self.retry.is_exhausted(queued.retry_count) {
                queued.next_retry_at =
                    now.saturating_add(self.retry.delay_for_attempt(queued.retry_count));
            } else {
                queued.terminal = true;
            }
            queued.retry_count
        };

        if self.retry.is_exhausted(retry_count) {
            self.give_up(action, &err.to_string());
            return false;
        }
        debug!(
            conversation = %action.conversation_id,
            key = %action.idempotency_key,
            retry_count,
            error = %err,
            "action failed, will retry"
        );
        self.persist_quietly();
        true
    }

    fn give_up(&self, action: &PendingAction, reason: &str) {
        if !self.remove(action) {
            return;
        }
        let conversation_id = action.conversation_id.clone();
        match action.kind() {
            ActionKind::SendMessage => {
                if let Some(message) =
                    self.resolver
                        .fail_pending(&conversation_id, &action.idempotency_key, reason)
                {
                    self.events.emit(SyncEvent::MessageFailed {
                        conversation_id,
                        message,
                        reason: reason.to_string(),
                    });
                }
            }
            kind => {
                warn!(conversation = %conversation_id, kind = %kind, reason, "action failed");
                self.events.emit(SyncEvent::ActionFailed {
                    conversation_id,
                    kind,
                    reason: reason.to_string(),
                });
            }
        }
        self.persist_quietly();
    }

    fn persist(&self) -> SyncResult<()> {
        let snapshot = {
            let state = self.state.lock();
            QueueSnapshot::new(state.next_seq, state.actions.values().cloned().collect())
        };
        let bytes = snapshot.encode()?;
        self.store.set(&self.storage_key, &bytes)?;
        Ok(())
    }

    fn persist_quietly(&self) {
        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist offline queue");
        }
    }
}
