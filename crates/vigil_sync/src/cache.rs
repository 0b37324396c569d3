//! In-memory conversation and message cache.
//!
//! [`CacheStore::apply_message`] is the only way message lists change. It
//! keeps every list sorted by `(created_at, id)` and holds at most one
//! message per slot (idempotency key, or id when there is no key).
//!
//! Each conversation lives behind its own mutex; the map lock is only held
//! long enough to find or create an entry, so unrelated conversations
//! mutate concurrently. Eviction marks an entry dead before unlinking it,
//! and writers that locked a dead entry look the conversation up again.

use crate::config::CacheConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_protocol::{
    CachePage, CacheSnapshot, Conversation, ConversationId, ConversationSnapshot, Message,
    MessageId, MessageState, Timestamp, UserId,
};
use vigil_storage::DurableStore;

/// How [`CacheStore::apply_message`] treats its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Insert, or merge into an existing slot without downgrading its state.
    Insert,
    /// Overwrite an existing slot. A confirmed message is never downgraded.
    Replace,
    /// Remove the slot.
    Remove,
}

/// What [`CacheStore::apply_message`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new slot was created.
    Inserted,
    /// An existing slot changed.
    Replaced,
    /// The slot already held an identical message.
    Unchanged,
    /// The input would have downgraded the slot and was dropped.
    Ignored,
    /// The slot was removed.
    Removed,
    /// Replace or remove of a slot that does not exist.
    Missing,
}

impl ApplyOutcome {
    /// Returns true if the cache changed.
    pub fn changed(self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Replaced | ApplyOutcome::Removed
        )
    }
}

/// Work done by one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Messages dropped by the per-conversation limit.
    pub trimmed_messages: usize,
    /// Conversations dropped entirely.
    pub evicted: Vec<ConversationId>,
    /// Confirmed messages pruned from pinned conversations.
    pub quota_pruned: usize,
}

impl EvictionReport {
    /// Returns true if nothing was dropped.
    pub fn is_empty(&self) -> bool {
        self.trimmed_messages == 0 && self.evicted.is_empty() && self.quota_pruned == 0
    }
}

/// Cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Cached conversations.
    pub conversations: usize,
    /// Cached messages.
    pub messages: usize,
    /// Conversations with unresolved queued actions.
    pub pinned_conversations: usize,
    /// Messages awaiting confirmation.
    pub pending_messages: usize,
    /// Messages that failed to send.
    pub failed_messages: usize,
}

struct Entry {
    conversation: Option<Conversation>,
    page: CachePage,
    pins: u32,
    touched: u64,
    evicted: bool,
}

impl Entry {
    fn new(id: ConversationId) -> Self {
        Self {
            conversation: None,
            page: CachePage::empty(id),
            pins: 0,
            touched: 0,
            evicted: false,
        }
    }

    fn refresh_cursor(&mut self) {
        self.page.oldest_loaded_id = self
            .page
            .messages
            .iter()
            .find(|m| m.is_confirmed())
            .map(|m| m.id.clone());
    }

    fn apply(&mut self, message: Message, mode: ApplyMode) -> ApplyOutcome {
        let messages = &mut self.page.messages;
        let created_at = message.created_at;
        let outcome = match (mode, collapse_slot(messages, &message)) {
            (ApplyMode::Remove, Some(idx)) => {
                messages.remove(idx);
                ApplyOutcome::Removed
            }
            (ApplyMode::Remove | ApplyMode::Replace, None) => ApplyOutcome::Missing,
            (ApplyMode::Insert, None) => {
                insert_sorted(messages, message);
                ApplyOutcome::Inserted
            }
            (ApplyMode::Insert, Some(idx)) => {
                if message.state.rank() < messages[idx].state.rank() {
                    ApplyOutcome::Ignored
                } else {
                    merge_at(messages, idx, message)
                }
            }
            (ApplyMode::Replace, Some(idx)) => {
                if messages[idx].is_confirmed() && !message.is_confirmed() {
                    ApplyOutcome::Ignored
                } else {
                    merge_at(messages, idx, message)
                }
            }
        };

        if matches!(outcome, ApplyOutcome::Inserted | ApplyOutcome::Replaced) {
            if let Some(conversation) = &mut self.conversation {
                conversation.touch_activity(created_at);
            }
        }
        if outcome.changed() {
            self.refresh_cursor();
        }
        outcome
    }

    /// Stamps `read_at` on confirmed messages from others, up to `up_to`.
    fn stamp_read(
        &mut self,
        reader: &UserId,
        up_to: Option<&MessageId>,
        read_at: Timestamp,
    ) -> usize {
        let boundary = up_to.map(|up_to| {
            self.page
                .messages
                .iter()
                .find(|m| &m.id == up_to)
                .map_or((read_at, None), |m| (m.created_at, Some(m.id.clone())))
        });
        let within = |m: &Message| match &boundary {
            None => true,
            Some((at, Some(boundary_id))) => m.order_key() <= (*at, boundary_id.as_str()),
            Some((at, None)) => m.created_at <= *at,
        };

        let updates: Vec<Message> = self
            .page
            .messages
            .iter()
            .filter(|m| m.is_confirmed() && m.read_at.is_none() && &m.sender_id != reader)
            .filter(|m| within(m))
            .map(|m| {
                let mut updated = m.clone();
                updated.read_at = Some(read_at);
                updated
            })
            .collect();

        let mut stamped = 0;
        for message in updates {
            if self.apply(message, ApplyMode::Replace).changed() {
                stamped += 1;
            }
        }
        stamped
    }

    /// Removes up to `count` of the oldest confirmed messages.
    fn prune_confirmed(&mut self, count: usize) -> usize {
        let mut left = count;
        self.page.messages.retain(|m| {
            if left > 0 && m.is_confirmed() {
                left -= 1;
                false
            } else {
                true
            }
        });
        let removed = count - left;
        if removed > 0 {
            self.page.has_more = true;
            self.refresh_cursor();
        }
        removed
    }
}

/// Finds the slot `message` belongs to, folding duplicates into one entry.
fn collapse_slot(messages: &mut Vec<Message>, message: &Message) -> Option<usize> {
    let matches: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.same_slot(message))
        .map(|(i, _)| i)
        .collect();
    let (&first, rest) = matches.split_first()?;
    if rest.is_empty() {
        return Some(first);
    }

    let mut best = first;
    for &i in rest {
        if messages[i].state.rank() > messages[best].state.rank() {
            best = i;
        }
    }
    let read_at = matches.iter().filter_map(|&i| messages[i].read_at).max();
    let key = matches
        .iter()
        .find_map(|&i| messages[i].idempotency_key.clone());
    if messages[best].read_at.is_none() {
        messages[best].read_at = read_at;
    }
    if messages[best].idempotency_key.is_none() {
        messages[best].idempotency_key = key;
    }

    let mut kept = best;
    for &i in matches.iter().rev() {
        if i != best {
            messages.remove(i);
            if i < kept {
                kept -= 1;
            }
        }
    }
    Some(kept)
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let pos = messages.partition_point(|m| m.order_key() < message.order_key());
    messages.insert(pos, message);
}

fn merge_at(messages: &mut Vec<Message>, idx: usize, incoming: Message) -> ApplyOutcome {
    let merged = incoming.merged_over(&messages[idx]);
    if merged == messages[idx] {
        return ApplyOutcome::Unchanged;
    }

    let fits_before = idx == 0 || messages[idx - 1].order_key() < merged.order_key();
    let fits_after =
        idx + 1 >= messages.len() || merged.order_key() < messages[idx + 1].order_key();
    if fits_before && fits_after {
        messages[idx] = merged;
    } else {
        messages.remove(idx);
        insert_sorted(messages, merged);
    }
    ApplyOutcome::Replaced
}

/// The local cache of conversations and their message windows.
pub struct CacheStore {
    config: CacheConfig,
    entries: RwLock<HashMap<ConversationId, Arc<Mutex<Entry>>>>,
    touch_counter: AtomicU64,
    events: EventBus,
}

impl CacheStore {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig, events: EventBus) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            touch_counter: AtomicU64::new(0),
            events,
        }
    }

    /// Returns the budgets.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.touch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn existing(&self, id: &ConversationId) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().get(id).map(Arc::clone)
    }

    fn entry(&self, id: &ConversationId) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self.existing(id) {
            return entry;
        }
        let mut map = self.entries.write();
        Arc::clone(
            map.entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Entry::new(id.clone())))),
        )
    }

    /// Runs `f` on the live entry for `id`, creating it if needed.
    fn write_entry<R>(&self, id: &ConversationId, f: impl FnOnce(&mut Entry) -> R) -> R {
        self.write_from(id, self.entry(id), f)
    }

    fn write_from<R>(
        &self,
        id: &ConversationId,
        mut entry: Arc<Mutex<Entry>>,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        loop {
            {
                let mut guard = entry.lock();
                if !guard.evicted {
                    return f(&mut *guard);
                }
            }
            entry = self.entry(id);
        }
    }

    /// Runs `f` on the live entry for `id`, if there is one.
    fn write_existing<R>(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        let mut entry = self.existing(id)?;
        loop {
            {
                let mut guard = entry.lock();
                if !guard.evicted {
                    return Some(f(&mut *guard));
                }
            }
            entry = self.existing(id)?;
        }
    }

    fn all_entries(&self) -> Vec<(ConversationId, Arc<Mutex<Entry>>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Returns cached conversations: unarchived first, then pinned, then
    /// most recent activity.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .all_entries()
            .into_iter()
            .filter_map(|(_, entry)| entry.lock().conversation.clone())
            .collect();
        conversations.sort_by(|a, b| {
            (a.archived, !a.pinned, Reverse(a.last_activity_at), &a.id).cmp(&(
                b.archived,
                !b.pinned,
                Reverse(b.last_activity_at),
                &b.id,
            ))
        });
        conversations
    }

    /// Returns one conversation's metadata.
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.existing(id)
            .and_then(|entry| entry.lock().conversation.clone())
    }

    /// Stores conversation metadata as given.
    pub fn upsert_conversation(&self, conversation: Conversation) -> Conversation {
        let id = conversation.id.clone();
        let stored = self.write_entry(&id, |entry| {
            entry.conversation = Some(conversation.clone());
            entry.touched = self.tick();
            conversation
        });
        self.evict_if_over_budget();
        stored
    }

    /// Stores server metadata, keeping the local pinned and archived flags
    /// and never moving last activity backwards.
    pub fn merge_remote_conversation(&self, mut remote: Conversation) -> Conversation {
        let id = remote.id.clone();
        let stored = self.write_entry(&id, |entry| {
            if let Some(local) = &entry.conversation {
                remote.pinned = local.pinned;
                remote.archived = local.archived;
                remote.touch_activity(local.last_activity_at);
            }
            if let Some(newest) = entry.page.newest() {
                remote.touch_activity(newest.created_at);
            }
            entry.conversation = Some(remote.clone());
            entry.touched = self.tick();
            remote
        });
        self.evict_if_over_budget();
        stored
    }

    /// Mutates cached metadata in place. Returns the new value, or `None`
    /// if the metadata is not cached.
    pub fn update_conversation(
        &self,
        id: &ConversationId,
        f: impl FnOnce(&mut Conversation),
    ) -> Option<Conversation> {
        self.write_existing(id, |entry| {
            let conversation = entry.conversation.as_mut()?;
            f(conversation);
            Some(conversation.clone())
        })
        .flatten()
    }

    /// Returns a copy of a conversation's message window.
    pub fn messages(&self, id: &ConversationId) -> CachePage {
        self.existing(id)
            .map(|entry| entry.lock().page.clone())
            .unwrap_or_else(|| CachePage::empty(id.clone()))
    }

    /// Finds a cached message by id or idempotency key.
    pub fn message(&self, id: &ConversationId, key: &str) -> Option<Message> {
        let entry = self.existing(id)?;
        let entry = entry.lock();
        entry.page.find(key).cloned()
    }

    /// Every cached `Pending` message, across conversations.
    pub fn pending_messages(&self) -> Vec<Message> {
        self.all_entries()
            .into_iter()
            .flat_map(|(_, entry)| {
                entry
                    .lock()
                    .page
                    .messages
                    .iter()
                    .filter(|m| m.is_pending())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Whether older messages may exist on the server.
    pub fn has_more(&self, id: &ConversationId) -> bool {
        self.existing(id).map_or(true, |entry| entry.lock().page.has_more)
    }

    /// Applies one message mutation. Insertions may trigger eviction.
    pub fn apply_message(
        &self,
        id: &ConversationId,
        message: Message,
        mode: ApplyMode,
    ) -> ApplyOutcome {
        if message.conversation_id != *id {
            warn!(
                conversation = %id,
                message_conversation = %message.conversation_id,
                message = %message.id,
                "message applied to the wrong conversation"
            );
            return ApplyOutcome::Ignored;
        }

        let write = |entry: &mut Entry| {
            let outcome = entry.apply(message, mode);
            if outcome.changed() {
                entry.touched = self.tick();
            }
            outcome
        };
        let outcome = match mode {
            ApplyMode::Insert => self.write_entry(id, write),
            ApplyMode::Replace | ApplyMode::Remove => self
                .write_existing(id, write)
                .unwrap_or(ApplyOutcome::Missing),
        };

        if outcome == ApplyOutcome::Inserted {
            self.evict_if_over_budget();
        }
        outcome
    }

    /// Stamps `read_at` on confirmed messages not sent by `reader`, up to
    /// and including `up_to` (everything when `None`). Returns how many
    /// messages changed.
    pub fn stamp_read(
        &self,
        id: &ConversationId,
        reader: &UserId,
        up_to: Option<&MessageId>,
        read_at: Timestamp,
    ) -> usize {
        self.write_existing(id, |entry| entry.stamp_read(reader, up_to, read_at))
            .unwrap_or(0)
    }

    /// Sets the backward pagination flag.
    pub fn set_cursor(&self, id: &ConversationId, has_more: bool) {
        self.write_entry(id, |entry| entry.page.has_more = has_more);
    }

    /// Drops confirmed messages ordered before `(created_at, message_id)`
    /// and re-arms backward pagination. Returns how many were dropped.
    pub fn truncate_before(
        &self,
        id: &ConversationId,
        created_at: Timestamp,
        message_id: &MessageId,
    ) -> usize {
        let boundary = (created_at, message_id.as_str());
        let dropped = self
            .write_existing(id, |entry| {
                let before = entry.page.messages.len();
                entry
                    .page
                    .messages
                    .retain(|m| !m.is_confirmed() || m.order_key() >= boundary);
                entry.page.has_more = true;
                entry.refresh_cursor();
                before - entry.page.messages.len()
            })
            .unwrap_or(0);
        if dropped > 0 {
            debug!(conversation = %id, dropped, "dropped messages behind a history gap");
        }
        dropped
    }

    /// Marks a conversation as recently used.
    pub fn touch(&self, id: &ConversationId) {
        self.write_existing(id, |entry| entry.touched = self.tick());
    }

    /// Adds a pin. Pinned conversations are never evicted.
    pub fn pin(&self, id: &ConversationId) -> u32 {
        self.write_entry(id, |entry| {
            entry.pins += 1;
            entry.pins
        })
    }

    /// Removes a pin.
    pub fn unpin(&self, id: &ConversationId) -> u32 {
        self.write_existing(id, |entry| {
            entry.pins = entry.pins.saturating_sub(1);
            entry.pins
        })
        .unwrap_or(0)
    }

    /// Returns the number of pins on a conversation.
    pub fn pins(&self, id: &ConversationId) -> u32 {
        self.existing(id).map_or(0, |entry| entry.lock().pins)
    }

    /// Brings the cache back within its budgets.
    ///
    /// Per-conversation lists are trimmed first, then least recently
    /// touched unpinned conversations are dropped. If pinned conversations
    /// alone exceed the message budget, their oldest confirmed messages
    /// are pruned; pending and failed messages always stay.
    pub fn evict_if_over_budget(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        let max_conversations = self.config.max_conversations;
        let max_total = self.config.max_total_messages;
        let per_conversation = self.config.max_messages_per_conversation;

        let mut census = Vec::new();
        for (id, entry) in self.all_entries() {
            let mut entry = entry.lock();
            let len = entry.page.len();
            if len > per_conversation {
                report.trimmed_messages += entry.prune_confirmed(len - per_conversation);
            }
            census.push((entry.touched, id, entry.page.len()));
        }

        let mut conversations = census.len();
        let mut total: usize = census.iter().map(|(_, _, len)| len).sum();
        census.sort();

        if conversations > max_conversations || total > max_total {
            let mut map = self.entries.write();
            for (_, id, _) in &census {
                if conversations <= max_conversations && total <= max_total {
                    break;
                }
                let Some(entry) = map.get(id) else {
                    continue;
                };
                let len = {
                    let mut entry = entry.lock();
                    if entry.pins > 0 {
                        continue;
                    }
                    entry.evicted = true;
                    entry.page.len()
                };
                map.remove(id);
                conversations -= 1;
                total = total.saturating_sub(len);
                report.evicted.push(id.clone());
            }
        }

        if total > max_total {
            let quota = SyncError::QuotaExceeded {
                cached: total,
                budget: max_total,
            };
            warn!(error = %quota, "pinned conversations exceed the message budget");
            for (_, id, _) in &census {
                if total <= max_total {
                    break;
                }
                if let Some(entry) = self.existing(id) {
                    let pruned = entry.lock().prune_confirmed(total - max_total);
                    total -= pruned;
                    report.quota_pruned += pruned;
                }
            }
        }
        if conversations > max_conversations {
            warn!(
                conversations,
                budget = max_conversations,
                "pinned conversations exceed the conversation budget"
            );
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                remaining = conversations,
                "evicted conversations from cache"
            );
            self.events
                .emit(SyncEvent::ConversationsEvicted(report.evicted.clone()));
        } else if !report.is_empty() {
            debug!(
                trimmed = report.trimmed_messages,
                pruned = report.quota_pruned,
                "trimmed cached messages"
            );
        }
        report
    }

    /// Returns cache occupancy.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (_, entry) in self.all_entries() {
            let entry = entry.lock();
            stats.conversations += 1;
            stats.messages += entry.page.len();
            if entry.pins > 0 {
                stats.pinned_conversations += 1;
            }
            for message in &entry.page.messages {
                match message.state {
                    MessageState::Pending => stats.pending_messages += 1,
                    MessageState::Failed => stats.failed_messages += 1,
                    MessageState::Confirmed => {}
                }
            }
        }
        stats
    }

    /// Copies the cache, least recently touched conversation first.
    pub fn snapshot(&self) -> CacheSnapshot {
        let mut rows: Vec<(u64, ConversationSnapshot)> = self
            .all_entries()
            .into_iter()
            .map(|(id, entry)| {
                let entry = entry.lock();
                (
                    entry.touched,
                    ConversationSnapshot {
                        conversation_id: id,
                        conversation: entry.conversation.clone(),
                        page: entry.page.clone(),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(touched, _)| *touched);
        CacheSnapshot::new(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// Replaces the cache contents with a snapshot. Messages are re-applied
    /// one by one, so a damaged snapshot still yields sorted, unique lists.
    /// Pins are not part of a snapshot and start at zero.
    pub fn restore(&self, snapshot: CacheSnapshot) -> usize {
        let mut map = HashMap::new();
        let mut restored = 0;
        for row in snapshot.conversations {
            let mut entry = Entry::new(row.conversation_id.clone());
            entry.conversation = row.conversation;
            for message in row.page.messages {
                if message.conversation_id == row.conversation_id
                    && entry.apply(message, ApplyMode::Insert) == ApplyOutcome::Inserted
                {
                    restored += 1;
                }
            }
            entry.page.has_more = row.page.has_more;
            entry.touched = self.tick();
            map.insert(row.conversation_id, Arc::new(Mutex::new(entry)));
        }
        let mut entries = self.entries.write();
        for entry in entries.values() {
            entry.lock().evicted = true;
        }
        *entries = map;
        restored
    }

    /// Writes a snapshot to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the store write fails.
    pub fn persist(&self, store: &dyn DurableStore, key: &str) -> SyncResult<()> {
        let snapshot = self.snapshot();
        let bytes = snapshot.encode()?;
        store.set(key, &bytes)?;
        debug!(
            conversations = snapshot.conversations.len(),
            bytes = bytes.len(),
            "persisted cache"
        );
        Ok(())
    }

    /// Loads a snapshot from durable storage. Returns the number of restored
    /// messages, or `None` when nothing was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the snapshot cannot be decoded.
    pub fn load(&self, store: &dyn DurableStore, key: &str) -> SyncResult<Option<usize>> {
        let Some(bytes) = store.get(key)? else {
            return Ok(None);
        };
        let snapshot = CacheSnapshot::decode(&bytes)?;
        let restored = self.restore(snapshot);
        info!(messages = restored, "restored cache");
        Ok(Some(restored))
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("conversations", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_protocol::{ContentType, IdempotencyKey};
    use vigil_storage::InMemoryStore;

    fn conv() -> ConversationId {
        ConversationId::from("c-1")
    }

    fn msg(id: &str, at: i64, state: MessageState) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: conv(),
            sender_id: UserId::from("bob"),
            content: format!("content of {id}"),
            content_type: ContentType::Text,
            media_url: None,
            media_duration_seconds: None,
            created_at: Timestamp::from_millis(at),
            read_at: None,
            idempotency_key: None,
            state,
        }
    }

    fn pending(key: &str, at: i64) -> Message {
        let mut m = msg(key, at, MessageState::Pending);
        m.sender_id = UserId::from("alice");
        m.idempotency_key = Some(IdempotencyKey::from(key));
        m
    }

    fn cache() -> CacheStore {
        CacheStore::new(CacheConfig::default(), EventBus::new(16))
    }

    fn ids(cache: &CacheStore) -> Vec<String> {
        cache
            .messages(&conv())
            .messages
            .iter()
            .map(|m| m.id.to_string())
            .collect()
    }

    #[test]
    fn inserts_keep_order() {
        let cache = cache();
        for (id, at) in [("m-3", 30), ("m-1", 10), ("m-2", 20), ("m-0", 20)] {
            assert_eq!(
                cache.apply_message(&conv(), msg(id, at, MessageState::Confirmed), ApplyMode::Insert),
                ApplyOutcome::Inserted
            );
        }
        assert_eq!(ids(&cache), ["m-1", "m-0", "m-2", "m-3"]);
        assert!(cache.messages(&conv()).is_sorted());
    }

    #[test]
    fn insert_is_idempotent() {
        let cache = cache();
        let m = msg("m-1", 10, MessageState::Confirmed);
        assert_eq!(
            cache.apply_message(&conv(), m.clone(), ApplyMode::Insert),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            cache.apply_message(&conv(), m, ApplyMode::Insert),
            ApplyOutcome::Unchanged
        );
        assert_eq!(cache.messages(&conv()).len(), 1);
    }

    #[test]
    fn insert_never_downgrades() {
        let cache = cache();
        let mut confirmed = pending("K1", 10).with_state(MessageState::Confirmed);
        confirmed.id = MessageId::from("m-42");
        cache.apply_message(&conv(), confirmed, ApplyMode::Insert);

        let outcome = cache.apply_message(&conv(), pending("K1", 10), ApplyMode::Insert);
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(ids(&cache), ["m-42"]);
        assert!(cache.messages(&conv()).messages[0].is_confirmed());
    }

    #[test]
    fn replace_swaps_pending_in_place() {
        let cache = cache();
        cache.apply_message(&conv(), msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K1", 20), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-3", 30, MessageState::Confirmed), ApplyMode::Insert);

        let mut confirmed = pending("K1", 21).with_state(MessageState::Confirmed);
        confirmed.id = MessageId::from("m-2");
        assert_eq!(
            cache.apply_message(&conv(), confirmed, ApplyMode::Replace),
            ApplyOutcome::Replaced
        );
        assert_eq!(ids(&cache), ["m-1", "m-2", "m-3"]);
        assert_eq!(cache.messages(&conv()).len(), 3);
    }

    #[test]
    fn replace_moves_when_order_breaks() {
        let cache = cache();
        cache.apply_message(&conv(), pending("K1", 10), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-2", 20, MessageState::Confirmed), ApplyMode::Insert);

        let mut confirmed = pending("K1", 25).with_state(MessageState::Confirmed);
        confirmed.id = MessageId::from("m-3");
        cache.apply_message(&conv(), confirmed, ApplyMode::Replace);

        assert_eq!(ids(&cache), ["m-2", "m-3"]);
        assert!(cache.messages(&conv()).is_sorted());
    }

    #[test]
    fn replace_never_downgrades_confirmed() {
        let cache = cache();
        cache.apply_message(&conv(), msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert);
        let outcome = cache.apply_message(
            &conv(),
            msg("m-1", 10, MessageState::Failed),
            ApplyMode::Replace,
        );
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[test]
    fn replace_and_remove_of_missing_slot() {
        let cache = cache();
        let m = msg("m-1", 10, MessageState::Confirmed);
        assert_eq!(
            cache.apply_message(&conv(), m.clone(), ApplyMode::Replace),
            ApplyOutcome::Missing
        );
        assert_eq!(
            cache.apply_message(&conv(), m.clone(), ApplyMode::Remove),
            ApplyOutcome::Missing
        );
        cache.apply_message(&conv(), m.clone(), ApplyMode::Insert);
        assert_eq!(
            cache.apply_message(&conv(), m, ApplyMode::Remove),
            ApplyOutcome::Removed
        );
        assert!(cache.messages(&conv()).is_empty());
    }

    #[test]
    fn merge_keeps_read_at() {
        let cache = cache();
        let mut read = msg("m-1", 10, MessageState::Confirmed);
        read.read_at = Some(Timestamp::from_millis(50));
        cache.apply_message(&conv(), read, ApplyMode::Insert);

        let outcome = cache.apply_message(
            &conv(),
            msg("m-1", 10, MessageState::Confirmed),
            ApplyMode::Insert,
        );
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(
            cache.messages(&conv()).messages[0].read_at,
            Some(Timestamp::from_millis(50))
        );
    }

    #[test]
    fn duplicate_slots_collapse() {
        let cache = cache();
        cache.apply_message(&conv(), pending("K1", 10), ApplyMode::Insert);
        // Same server message arriving without its key.
        cache.apply_message(&conv(), msg("m-42", 12, MessageState::Confirmed), ApplyMode::Insert);
        assert_eq!(cache.messages(&conv()).len(), 2);

        // Once a copy carrying both id and key shows up, the slots merge.
        let mut both = pending("K1", 12).with_state(MessageState::Confirmed);
        both.id = MessageId::from("m-42");
        cache.apply_message(&conv(), both, ApplyMode::Insert);

        let page = cache.messages(&conv());
        assert_eq!(ids(&cache), ["m-42"]);
        assert_eq!(
            page.messages[0].idempotency_key,
            Some(IdempotencyKey::from("K1"))
        );
    }

    #[test]
    fn cursor_tracks_oldest_confirmed() {
        let cache = cache();
        cache.apply_message(&conv(), pending("K1", 5), ApplyMode::Insert);
        assert_eq!(cache.messages(&conv()).oldest_loaded_id, None);

        cache.apply_message(&conv(), msg("m-7", 7, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-9", 9, MessageState::Confirmed), ApplyMode::Insert);
        assert_eq!(
            cache.messages(&conv()).oldest_loaded_id,
            Some(MessageId::from("m-7"))
        );
        assert!(cache.has_more(&conv()));
        cache.set_cursor(&conv(), false);
        assert!(!cache.has_more(&conv()));
    }

    #[test]
    fn inserts_bump_activity() {
        let cache = cache();
        cache.upsert_conversation(Conversation::new("c-1", "alice", "bob", Timestamp::from_millis(1)));
        cache.apply_message(&conv(), msg("m-1", 500, MessageState::Confirmed), ApplyMode::Insert);
        assert_eq!(
            cache.conversation(&conv()).unwrap().last_activity_at,
            Timestamp::from_millis(500)
        );
    }

    #[test]
    fn conversations_are_ordered() {
        let cache = cache();
        let mut archived = Conversation::new("c-a", "me", "x", Timestamp::from_millis(900));
        archived.archived = true;
        let mut pinned = Conversation::new("c-p", "me", "y", Timestamp::from_millis(10));
        pinned.pinned = true;
        cache.upsert_conversation(archived);
        cache.upsert_conversation(pinned);
        cache.upsert_conversation(Conversation::new("c-old", "me", "z", Timestamp::from_millis(20)));
        cache.upsert_conversation(Conversation::new("c-new", "me", "w", Timestamp::from_millis(30)));

        let order: Vec<String> = cache
            .conversations()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(order, ["c-p", "c-new", "c-old", "c-a"]);
    }

    #[test]
    fn remote_merge_keeps_local_flags() {
        let cache = cache();
        let mut local = Conversation::new("c-1", "a", "b", Timestamp::from_millis(100));
        local.pinned = true;
        cache.upsert_conversation(local);

        let mut remote = Conversation::new("c-1", "a", "b", Timestamp::from_millis(50));
        remote.unread_count = 4;
        let merged = cache.merge_remote_conversation(remote);

        assert!(merged.pinned);
        assert_eq!(merged.unread_count, 4);
        assert_eq!(merged.last_activity_at, Timestamp::from_millis(100));
    }

    #[test]
    fn stamp_read_up_to_boundary() {
        let cache = cache();
        cache.apply_message(&conv(), msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-2", 20, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-3", 30, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K1", 40), ApplyMode::Insert);

        let stamped = cache.stamp_read(
            &conv(),
            &UserId::from("alice"),
            Some(&MessageId::from("m-2")),
            Timestamp::from_millis(99),
        );
        assert_eq!(stamped, 2);

        let page = cache.messages(&conv());
        assert!(page.find("m-1").unwrap().read_at.is_some());
        assert!(page.find("m-2").unwrap().read_at.is_some());
        assert!(page.find("m-3").unwrap().read_at.is_none());

        let stamped = cache.stamp_read(&conv(), &UserId::from("alice"), None, Timestamp::from_millis(100));
        assert_eq!(stamped, 1);
        // Own messages are never stamped by the reader.
        assert_eq!(
            cache.stamp_read(&conv(), &UserId::from("bob"), None, Timestamp::from_millis(101)),
            0
        );
    }

    #[test]
    fn truncate_before_keeps_unconfirmed() {
        let cache = cache();
        cache.apply_message(&conv(), msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K1", 15), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-5", 50, MessageState::Confirmed), ApplyMode::Insert);
        cache.set_cursor(&conv(), false);

        let dropped = cache.truncate_before(&conv(), Timestamp::from_millis(50), &MessageId::from("m-5"));
        assert_eq!(dropped, 1);
        assert_eq!(ids(&cache), ["K1", "m-5"]);
        assert!(cache.has_more(&conv()));
    }

    #[test]
    fn trims_per_conversation_oldest_confirmed_first() {
        let cache = CacheStore::new(
            CacheConfig::new(10, 3, 100),
            EventBus::new(16),
        );
        cache.apply_message(&conv(), pending("K0", 1), ApplyMode::Insert);
        for i in 2..=5 {
            cache.apply_message(
                &conv(),
                msg(&format!("m-{i}"), i, MessageState::Confirmed),
                ApplyMode::Insert,
            );
        }
        assert_eq!(ids(&cache), ["K0", "m-4", "m-5"]);
        assert!(cache.has_more(&conv()));
    }

    #[test]
    fn evicts_least_recently_touched_unpinned() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let cache = CacheStore::new(CacheConfig::new(2, 100, 1_000), events);

        let a = ConversationId::from("c-a");
        let b = ConversationId::from("c-b");
        let c = ConversationId::from("c-c");
        cache.upsert_conversation(Conversation::new(a.clone(), "me", "x", Timestamp::EPOCH));
        cache.upsert_conversation(Conversation::new(b.clone(), "me", "y", Timestamp::EPOCH));
        cache.pin(&a);
        cache.upsert_conversation(Conversation::new(c.clone(), "me", "z", Timestamp::EPOCH));

        assert!(cache.conversation(&a).is_some());
        assert!(cache.conversation(&b).is_none());
        assert!(cache.conversation(&c).is_some());
        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::ConversationsEvicted(vec![b])
        );
    }

    #[test]
    fn write_racing_eviction_lands_in_live_entry() {
        let cache = CacheStore::new(CacheConfig::new(1, 100, 1_000), EventBus::new(16));
        // A writer looked the entry up, then lost the race to an eviction.
        let stale = cache.entry(&conv());
        cache.upsert_conversation(Conversation::new("c-2", "me", "x", Timestamp::EPOCH));
        assert!(stale.lock().evicted);
        assert!(cache.existing(&conv()).is_none());

        let outcome = cache.write_from(&conv(), stale, |entry| {
            entry.apply(msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert)
        });
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert_eq!(ids(&cache), ["m-1"]);
    }

    #[test]
    fn restore_detaches_previous_entries() {
        let cache = cache();
        let before = cache.entry(&conv());
        cache.restore(CacheSnapshot::new(Vec::new()));
        assert!(before.lock().evicted);

        cache.pin(&conv());
        assert_eq!(cache.pins(&conv()), 1);
    }

    #[test]
    fn concurrent_inserts_and_evictions_keep_pinned_messages() {
        let cache = Arc::new(CacheStore::new(CacheConfig::new(2, 100, 1_000), EventBus::new(16)));
        cache.pin(&conv());

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..200 {
                    cache.apply_message(
                        &conv(),
                        msg(&format!("m-{i:03}"), i, MessageState::Confirmed),
                        ApplyMode::Insert,
                    );
                }
            })
        };
        let churn = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let id = format!("c-churn-{i}");
                    cache.upsert_conversation(Conversation::new(id, "me", "x", Timestamp::EPOCH));
                }
            })
        };
        writer.join().unwrap();
        churn.join().unwrap();

        assert_eq!(cache.messages(&conv()).len(), 100);
        assert!(cache.messages(&conv()).is_sorted());
    }

    #[test]
    fn total_budget_prunes_pinned_confirmed_only() {
        let cache = CacheStore::new(CacheConfig::new(10, 100, 3), EventBus::new(16));
        cache.pin(&conv());
        cache.apply_message(&conv(), pending("K1", 1), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K2", 2), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-3", 3, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), msg("m-4", 4, MessageState::Confirmed), ApplyMode::Insert);

        assert_eq!(ids(&cache), ["K1", "K2", "m-4"]);

        cache.apply_message(&conv(), pending("K5", 5), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K6", 6), ApplyMode::Insert);
        // Nothing confirmed is left to prune; pending messages stay.
        assert_eq!(ids(&cache), ["K1", "K2", "K5", "K6"]);
        assert_eq!(cache.stats().pending_messages, 4);
    }

    #[test]
    fn pins_count() {
        let cache = cache();
        assert_eq!(cache.pin(&conv()), 1);
        assert_eq!(cache.pin(&conv()), 2);
        assert_eq!(cache.unpin(&conv()), 1);
        assert_eq!(cache.unpin(&conv()), 0);
        assert_eq!(cache.unpin(&conv()), 0);
        assert_eq!(cache.pins(&ConversationId::from("c-unknown")), 0);
    }

    #[test]
    fn wrong_conversation_is_ignored() {
        let cache = cache();
        let outcome = cache.apply_message(
            &ConversationId::from("c-2"),
            msg("m-1", 1, MessageState::Confirmed),
            ApplyMode::Insert,
        );
        assert_eq!(outcome, ApplyOutcome::Ignored);
    }

    #[test]
    fn persist_and_load() {
        let store = InMemoryStore::new();
        let cache = cache();
        cache.upsert_conversation(Conversation::new("c-1", "alice", "bob", Timestamp::EPOCH));
        cache.apply_message(&conv(), msg("m-1", 10, MessageState::Confirmed), ApplyMode::Insert);
        cache.apply_message(&conv(), pending("K1", 20), ApplyMode::Insert);
        cache.set_cursor(&conv(), false);
        cache.persist(&store, "vigil/cache.v1").unwrap();

        let restored = self::cache();
        assert_eq!(restored.load(&store, "vigil/cache.v1").unwrap(), Some(2));
        assert_eq!(restored.messages(&conv()), cache.messages(&conv()));
        assert_eq!(restored.conversation(&conv()), cache.conversation(&conv()));
        assert!(!restored.has_more(&conv()));

        assert_eq!(self::cache().load(&store, "vigil/missing").unwrap(), None);
    }

    #[test]
    fn restore_repairs_order() {
        let mut page = CachePage::empty(conv());
        page.messages = vec![
            msg("m-2", 20, MessageState::Confirmed),
            msg("m-1", 10, MessageState::Confirmed),
            msg("m-2", 20, MessageState::Confirmed),
        ];
        let snapshot = CacheSnapshot::new(vec![ConversationSnapshot {
            conversation_id: conv(),
            conversation: None,
            page,
        }]);

        let cache = cache();
        assert_eq!(cache.restore(snapshot), 2);
        assert_eq!(ids(&cache), ["m-1", "m-2"]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(u8, i64, u8),
            Replace(u8, i64, u8),
            Remove(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..12, 0i64..20, 0u8..3).prop_map(|(k, t, s)| Op::Insert(k, t, s)),
                (0u8..12, 0i64..20, 0u8..3).prop_map(|(k, t, s)| Op::Replace(k, t, s)),
                (0u8..12).prop_map(Op::Remove),
            ]
        }

        fn build(key: u8, at: i64, state: u8) -> Message {
            let state = match state {
                0 => MessageState::Pending,
                1 => MessageState::Failed,
                _ => MessageState::Confirmed,
            };
            let mut m = msg(&format!("id-{key}"), at, state);
            m.idempotency_key = Some(IdempotencyKey::from(format!("K{key}")));
            m
        }

        proptest! {
            #[test]
            fn lists_stay_sorted_and_unique(ops in prop::collection::vec(op(), 1..60)) {
                let cache = cache();
                for op in ops {
                    match op {
                        Op::Insert(k, t, s) => cache.apply_message(&conv(), build(k, t, s), ApplyMode::Insert),
                        Op::Replace(k, t, s) => cache.apply_message(&conv(), build(k, t, s), ApplyMode::Replace),
                        Op::Remove(k) => cache.apply_message(&conv(), build(k, 0, 0), ApplyMode::Remove),
                    };
                    let page = cache.messages(&conv());
                    prop_assert!(page.is_sorted());
                    let mut slots: Vec<&str> = page.messages.iter().map(Message::slot_key).collect();
                    slots.sort_unstable();
                    slots.dedup();
                    prop_assert_eq!(slots.len(), page.len());
                }
            }

            #[test]
            fn insert_twice_equals_once(keys in prop::collection::vec((0u8..12, 0i64..20, 0u8..3), 1..30)) {
                let once = cache();
                let twice = cache();
                for (k, t, s) in keys {
                    once.apply_message(&conv(), build(k, t, s), ApplyMode::Insert);
                    twice.apply_message(&conv(), build(k, t, s), ApplyMode::Insert);
                    twice.apply_message(&conv(), build(k, t, s), ApplyMode::Insert);
                }
                prop_assert_eq!(once.messages(&conv()), twice.messages(&conv()));
            }
        }
    }
}
