//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages per backward page fetch.
    pub page_size: usize,
    /// Timeout applied to every backend call.
    pub request_timeout: Duration,
    /// Period of the background retry sweep.
    pub retry_tick: Duration,
    /// Maximum message length in characters.
    pub max_content_chars: usize,
    /// Pages fetched while closing a gap after reconnecting.
    pub gap_fill_max_pages: usize,
    /// Prefix of the durable storage keys.
    pub storage_prefix: String,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Cache budgets.
    pub cache: CacheConfig,
    /// Retry configuration for queued actions.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            page_size: 50,
            request_timeout: Duration::from_secs(15),
            retry_tick: Duration::from_secs(1),
            max_content_chars: 4000,
            gap_fill_max_pages: 4,
            storage_prefix: "vigil".into(),
            event_capacity: 256,
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry sweep period.
    pub fn with_retry_tick(mut self, tick: Duration) -> Self {
        self.retry_tick = tick;
        self
    }

    /// Sets the maximum message length.
    pub fn with_max_content_chars(mut self, max: usize) -> Self {
        self.max_content_chars = max;
        self
    }

    /// Sets how many pages a reconnect may fetch to close a gap.
    pub fn with_gap_fill_max_pages(mut self, pages: usize) -> Self {
        self.gap_fill_max_pages = pages.max(1);
        self
    }

    /// Sets the durable storage key prefix.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Sets the cache budgets.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Storage key of the cache snapshot.
    pub fn cache_key(&self) -> String {
        format!("{}/cache.v1", self.storage_prefix)
    }

    /// Storage key of the queue snapshot.
    pub fn queue_key(&self) -> String {
        format!("{}/queue.v1", self.storage_prefix)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Count-based cache budgets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum cached conversations.
    pub max_conversations: usize,
    /// Maximum cached messages in one conversation.
    pub max_messages_per_conversation: usize,
    /// Maximum cached messages overall.
    pub max_total_messages: usize,
}

impl CacheConfig {
    /// Creates a configuration with explicit budgets.
    pub fn new(
        max_conversations: usize,
        max_messages_per_conversation: usize,
        max_total_messages: usize,
    ) -> Self {
        Self {
            max_conversations,
            max_messages_per_conversation,
            max_total_messages,
        }
    }

    /// Sets the conversation budget.
    pub fn with_max_conversations(mut self, max: usize) -> Self {
        self.max_conversations = max;
        self
    }

    /// Sets the per-conversation message budget.
    pub fn with_max_messages_per_conversation(mut self, max: usize) -> Self {
        self.max_messages_per_conversation = max;
        self
    }

    /// Sets the total message budget.
    pub fn with_max_total_messages(mut self, max: usize) -> Self {
        self.max_total_messages = max;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(200, 500, 20_000)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first failed attempt before giving up.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the default schedule.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    /// Creates a configuration that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true once `retry_count` failures exhaust the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }

    /// Calculates the delay after the given number of failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
