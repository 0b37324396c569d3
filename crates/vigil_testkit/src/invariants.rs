//! Invariant checks for cached conversation windows.

use std::collections::HashSet;
use std::fmt;
use vigil_protocol::{CachePage, ConversationId, IdempotencyKey, Message};
use vigil_sync::{ApplyMode, ApplyOutcome, CacheStore, ConflictResolver, ReconcileOutcome};

/// A broken cache invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Messages out of `(created_at, id)` order.
    Unordered {
        /// Conversation.
        conversation: ConversationId,
        /// Index of the first message out of place.
        index: usize,
    },
    /// Two messages share an id or idempotency key.
    DuplicateSlot {
        /// Conversation.
        conversation: ConversationId,
        /// The shared id or key.
        slot: String,
    },
    /// A message filed under the wrong conversation.
    ForeignMessage {
        /// Conversation whose window holds it.
        conversation: ConversationId,
        /// The message id.
        message: String,
    },
    /// A cache budget is exceeded by unpinned data.
    OverBudget {
        /// Which budget.
        budget: &'static str,
        /// Observed value.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unordered {
                conversation,
                index,
            } => write!(f, "{conversation}: message {index} is out of order"),
            Self::DuplicateSlot { conversation, slot } => {
                write!(f, "{conversation}: slot {slot} is occupied twice")
            }
            Self::ForeignMessage {
                conversation,
                message,
            } => write!(f, "{conversation}: holds {message} of another conversation"),
            Self::OverBudget {
                budget,
                actual,
                limit,
            } => write!(f, "{budget} is {actual}, limit {limit}"),
        }
    }
}

/// Checks ordering, slot uniqueness and membership of one window.
pub fn check_page(page: &CachePage) -> Result<(), InvariantViolation> {
    let conversation = &page.conversation_id;
    if let Some(index) = page
        .messages
        .windows(2)
        .position(|pair| pair[0].order_key() >= pair[1].order_key())
    {
        return Err(InvariantViolation::Unordered {
            conversation: conversation.clone(),
            index: index + 1,
        });
    }

    let mut ids = HashSet::new();
    let mut keys = HashSet::new();
    for message in &page.messages {
        if &message.conversation_id != conversation {
            return Err(InvariantViolation::ForeignMessage {
                conversation: conversation.clone(),
                message: message.id.to_string(),
            });
        }
        let duplicate = if !ids.insert(message.id.as_str()) {
            Some(message.id.to_string())
        } else {
            message
                .idempotency_key
                .as_ref()
                .filter(|key| !keys.insert(key.as_str()))
                .map(ToString::to_string)
        };
        if let Some(slot) = duplicate {
            return Err(InvariantViolation::DuplicateSlot {
                conversation: conversation.clone(),
                slot,
            });
        }
    }
    Ok(())
}

/// Checks every cached window and the budgets that unpinned data must
/// respect. Returns all violations found.
pub fn check_cache(cache: &CacheStore) -> Vec<InvariantViolation> {
    let snapshot = cache.snapshot();
    let mut violations: Vec<InvariantViolation> = snapshot
        .conversations
        .iter()
        .filter_map(|row| check_page(&row.page).err())
        .collect();

    let config = cache.config();
    let stats = cache.stats();
    if stats.pinned_conversations == 0 {
        if stats.conversations > config.max_conversations {
            violations.push(InvariantViolation::OverBudget {
                budget: "conversations",
                actual: stats.conversations,
                limit: config.max_conversations,
            });
        }
        if stats.messages > config.max_total_messages {
            violations.push(InvariantViolation::OverBudget {
                budget: "total messages",
                actual: stats.messages,
                limit: config.max_total_messages,
            });
        }
    }
    for row in &snapshot.conversations {
        let unpinned = cache.pins(&row.conversation_id) == 0;
        if unpinned && row.page.len() > config.max_messages_per_conversation {
            violations.push(InvariantViolation::OverBudget {
                budget: "messages per conversation",
                actual: row.page.len(),
                limit: config.max_messages_per_conversation,
            });
        }
    }
    violations
}

/// One mutation of a conversation window, as produced by the generators.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// `apply_message(Insert)`.
    Insert(Message),
    /// `apply_message(Replace)`.
    Replace(Message),
    /// `apply_message(Remove)`.
    Remove(Message),
    /// A push or page delivery through the resolver.
    Inbound(Message),
    /// A send confirmation through the resolver.
    ConfirmSend {
        /// Key the send was queued under.
        key: IdempotencyKey,
        /// The server record.
        server: Message,
    },
}

/// Result of [`apply_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// Direct cache mutation.
    Applied(ApplyOutcome),
    /// Mutation through the resolver.
    Reconciled(ReconcileOutcome),
}

/// Applies `op` to `conversation`.
pub fn apply_op(
    cache: &CacheStore,
    resolver: &ConflictResolver,
    conversation: &ConversationId,
    op: CacheOp,
) -> OpOutcome {
    let apply = |m, mode| OpOutcome::Applied(cache.apply_message(conversation, m, mode));
    match op {
        CacheOp::Insert(m) => apply(m, ApplyMode::Insert),
        CacheOp::Replace(m) => apply(m, ApplyMode::Replace),
        CacheOp::Remove(m) => apply(m, ApplyMode::Remove),
        CacheOp::Inbound(m) => OpOutcome::Reconciled(resolver.reconcile_inbound(conversation, m)),
        CacheOp::ConfirmSend { key, server } => {
            OpOutcome::Reconciled(resolver.reconcile_send(conversation, &key, server))
        }
    }
}
