//! Reconciliation of optimistic local state with server state.

use crate::cache::{ApplyMode, ApplyOutcome, CacheStore};
use std::sync::Arc;
use tracing::{debug, warn};
use vigil_protocol::{ConversationId, IdempotencyKey, Message, MessageState};

/// Result of reconciling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The message was new to the cache.
    Inserted,
    /// An existing slot was updated.
    Replaced,
    /// The cache already reflected the message.
    Unchanged,
}

impl From<ApplyOutcome> for ReconcileOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Inserted => ReconcileOutcome::Inserted,
            ApplyOutcome::Replaced | ApplyOutcome::Removed => ReconcileOutcome::Replaced,
            ApplyOutcome::Unchanged | ApplyOutcome::Ignored | ApplyOutcome::Missing => {
                ReconcileOutcome::Unchanged
            }
        }
    }
}

/// Merges server-confirmed messages into the cache.
///
/// Every path goes through [`CacheStore::apply_message`]; a message matches
/// an existing slot by idempotency key or id, so a push echo, a send
/// response and a fetched page all land in the same slot.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    cache: Arc<CacheStore>,
}

impl ConflictResolver {
    /// Creates a resolver over `cache`.
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self { cache }
    }

    /// Swaps the pending message sent under `pending_key` for the server's
    /// confirmed record.
    pub fn reconcile_send(
        &self,
        conversation_id: &ConversationId,
        pending_key: &IdempotencyKey,
        mut server: Message,
    ) -> ReconcileOutcome {
        if server.idempotency_key.is_none() {
            server.idempotency_key = Some(pending_key.clone());
        }
        server.state = MessageState::Confirmed;

        let outcome = match self
            .cache
            .apply_message(conversation_id, server.clone(), ApplyMode::Replace)
        {
            ApplyOutcome::Missing => {
                self.cache
                    .apply_message(conversation_id, server, ApplyMode::Insert)
            }
            outcome => outcome,
        };
        debug!(
            conversation = %conversation_id,
            key = %pending_key,
            outcome = ?outcome,
            "reconciled send"
        );
        outcome.into()
    }

    /// Applies a message received from the server outside of a send.
    ///
    /// Applying the same candidate twice leaves the cache as applying it once.
    pub fn reconcile_inbound(
        &self,
        conversation_id: &ConversationId,
        mut candidate: Message,
    ) -> ReconcileOutcome {
        candidate.state = MessageState::Confirmed;
        self.cache
            .apply_message(conversation_id, candidate, ApplyMode::Insert)
            .into()
    }

    /// Marks a pending message as failed. Returns the updated message.
    pub fn fail_pending(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
        reason: &str,
    ) -> Option<Message> {
        let message = self.cache.message(conversation_id, key.as_str())?;
        if !message.is_pending() {
            return None;
        }
        let failed = message.with_state(MessageState::Failed);
        if self
            .cache
            .apply_message(conversation_id, failed.clone(), ApplyMode::Replace)
            .changed()
        {
            warn!(conversation = %conversation_id, key = %key, reason, "message failed to send");
            Some(failed)
        } else {
            None
        }
    }

    /// Returns a failed message to pending. Returns the updated message.
    pub fn reset_to_pending(
        &self,
        conversation_id: &ConversationId,
        key: &IdempotencyKey,
    ) -> Option<Message> {
        let message = self.cache.message(conversation_id, key.as_str())?;
        if message.state != MessageState::Failed {
            return None;
        }
        let pending = message.with_state(MessageState::Pending);
        self.cache
            .apply_message(conversation_id, pending.clone(), ApplyMode::Replace)
            .changed()
            .then_some(pending)
    }
}
