//! Backward history loading and newest-page refresh.

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ReconcileOutcome};
use crate::error::{SyncError, SyncResult};
use crate::transport::{with_timeout, ChatBackend};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use vigil_protocol::{ConversationId, FetchMessagesQuery, Message, MessageId};

/// Loads history pages into the cache, one fetch per conversation at a time.
pub struct Paginator {
    cache: Arc<CacheStore>,
    resolver: ConflictResolver,
    backend: Arc<dyn ChatBackend>,
    page_size: usize,
    request_timeout: Duration,
    gap_fill_max_pages: usize,
    online: Arc<AtomicBool>,
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Paginator {
    /// Creates a paginator.
    pub fn new(
        config: &SyncConfig,
        cache: Arc<CacheStore>,
        backend: Arc<dyn ChatBackend>,
        online: Arc<AtomicBool>,
    ) -> Self {
        Self {
            resolver: ConflictResolver::new(Arc::clone(&cache)),
            cache,
            backend,
            page_size: config.page_size.max(1),
            request_timeout: config.request_timeout,
            gap_fill_max_pages: config.gap_fill_max_pages.max(1),
            online,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether older messages may exist on the server.
    pub fn has_more(&self, conversation_id: &ConversationId) -> bool {
        self.cache.has_more(conversation_id)
    }

    /// Fetches the page before the oldest cached confirmed message.
    /// Returns how many fetched messages are new and still cached.
    ///
    /// When the conversation's window is at its message limit, an older
    /// page is trimmed right back out. Paging then stops: the cursor is
    /// cleared until the window has room again.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotConnected`] while offline, or the backend
    /// error. A timeout is [`SyncError::Timeout`].
    pub async fn load_older(&self, conversation_id: &ConversationId) -> SyncResult<usize> {
        self.ensure_online()?;
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        if !self.cache.has_more(conversation_id) {
            return Ok(0);
        }
        let cursor = self.cache.messages(conversation_id).oldest_loaded_id;
        let query = match &cursor {
            Some(oldest) => FetchMessagesQuery::before(self.page_size, oldest.clone()),
            None => FetchMessagesQuery::latest(self.page_size),
        };

        let batch = self.fetch(conversation_id, &query).await?;
        let fetched = batch.len();
        let loaded = self.merge(conversation_id, batch);
        let stalled = fetched > 0
            && loaded == 0
            && self.cache.messages(conversation_id).oldest_loaded_id == cursor;
        if stalled {
            info!(
                conversation = %conversation_id,
                fetched,
                "message window full, stopped paging back"
            );
        }
        let has_more = fetched >= self.page_size && !stalled;
        if !has_more {
            self.cache.set_cursor(conversation_id, false);
        }
        debug!(
            conversation = %conversation_id,
            fetched,
            loaded,
            has_more,
            "loaded older messages"
        );
        Ok(loaded)
    }

    /// Fetches the newest messages and closes any gap to the cached ones.
    ///
    /// Walks backward until the fetched window overlaps the cache, history
    /// ends, or the page limit is hit. A gap that remains drops the cached
    /// confirmed messages behind it so [`load_older`](Self::load_older)
    /// re-fetches them in order. Returns how many messages were new.
    ///
    /// # Errors
    ///
    /// Same as [`load_older`](Self::load_older).
    pub async fn refresh_latest(&self, conversation_id: &ConversationId) -> SyncResult<usize> {
        self.ensure_online()?;
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;

        let cached: HashSet<MessageId> = self
            .cache
            .messages(conversation_id)
            .messages
            .into_iter()
            .filter(Message::is_confirmed)
            .map(|m| m.id)
            .collect();

        let mut query = FetchMessagesQuery::latest(self.page_size);
        let mut inserted = 0;
        let mut pages = 0;
        let mut gap = None;
        loop {
            let batch = self.fetch(conversation_id, &query).await?;
            pages += 1;
            let full = batch.len() >= self.page_size;
            let overlaps = batch.iter().any(|m| cached.contains(&m.id));
            let oldest = batch.iter().min_by(|a, b| a.order_key().cmp(&b.order_key())).cloned();
            inserted += self.merge(conversation_id, batch);

            let Some(oldest) = oldest else {
                break;
            };
            if cached.is_empty() || overlaps || !full {
                if cached.is_empty() && !full {
                    self.cache.set_cursor(conversation_id, false);
                }
                break;
            }
            if pages >= self.gap_fill_max_pages {
                gap = Some(oldest);
                break;
            }
            query = FetchMessagesQuery::before(self.page_size, oldest.id);
        }

        if let Some(oldest) = gap {
            let dropped = self
                .cache
                .truncate_before(conversation_id, oldest.created_at, &oldest.id);
            info!(
                conversation = %conversation_id,
                pages,
                dropped,
                "history gap left open after refresh"
            );
        }
        debug!(conversation = %conversation_id, pages, inserted, "refreshed newest messages");
        Ok(inserted)
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    fn lock_for(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(conversation_id.clone())
                .or_default(),
        )
    }

    async fn fetch(
        &self,
        conversation_id: &ConversationId,
        query: &FetchMessagesQuery,
    ) -> SyncResult<Vec<Message>> {
        with_timeout(
            self.request_timeout,
            self.backend.fetch_messages(conversation_id, query),
        )
        .await
    }

    /// Merges a fetched batch. Returns how many of its messages were new
    /// and survived the eviction passes the inserts triggered.
    fn merge(&self, conversation_id: &ConversationId, batch: Vec<Message>) -> usize {
        let inserted: Vec<MessageId> = batch
            .into_iter()
            .filter_map(|m| {
                let id = m.id.clone();
                let outcome = self.resolver.reconcile_inbound(conversation_id, m);
                (outcome == ReconcileOutcome::Inserted).then_some(id)
            })
            .collect();
        if inserted.is_empty() {
            return 0;
        }
        let page = self.cache.messages(conversation_id);
        inserted
            .iter()
            .filter(|id| page.find(id.as_str()).is_some())
            .count()
    }
}

impl std::fmt::Debug for Paginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("page_size", &self.page_size)
            .field("gap_fill_max_pages", &self.gap_fill_max_pages)
            .finish_non_exhaustive()
    }
}
