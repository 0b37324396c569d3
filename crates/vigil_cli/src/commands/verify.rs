//! Verify command implementation.

use super::PersistedState;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use vigil_protocol::{ActionKind, ConversationId, ConversationSnapshot, MessageState};
use vigil_sync::{CacheConfig, SyncConfig};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of conversations checked.
    pub conversations_checked: usize,
    /// Number of messages checked.
    pub messages_checked: usize,
    /// Number of queued actions checked.
    pub actions_checked: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {:?}", path);
    println!();

    let state = PersistedState::load(path)?;
    if state.cache.is_none() {
        println!("Cache snapshot not found (this may be normal for a new store)");
    }
    if state.queue.is_none() {
        println!("Queue snapshot not found (this may be normal for a new store)");
    }

    let result = check(&state, &SyncConfig::default().cache);
    println!("Conversations checked: {}", result.conversations_checked);
    println!("Messages checked:      {}", result.messages_checked);
    println!("Actions checked:       {}", result.actions_checked);
    for err in &result.errors {
        println!("  ERROR: {}", err);
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks the loaded snapshots against the cache and queue invariants.
pub fn check(state: &PersistedState, budget: &CacheConfig) -> VerifyResult {
    let mut result = VerifyResult::default();
    let rows = state
        .cache
        .as_ref()
        .map_or(&[][..], |cache| cache.conversations.as_slice());
    let actions = state
        .queue
        .as_ref()
        .map_or(&[][..], |queue| queue.actions.as_slice());

    let pinned: BTreeSet<&ConversationId> = actions
        .iter()
        .filter(|a| !a.terminal)
        .map(|a| &a.conversation_id)
        .collect();

    for row in rows {
        result.conversations_checked += 1;
        result.messages_checked += row.page.len();
        check_window(row, &mut result.errors);
        if !pinned.contains(&row.conversation_id)
            && row.page.len() > budget.max_messages_per_conversation
        {
            result.errors.push(format!(
                "{}: {} messages exceed the per-conversation budget of {}",
                row.conversation_id,
                row.page.len(),
                budget.max_messages_per_conversation
            ));
        }
    }

    if pinned.is_empty() {
        if rows.len() > budget.max_conversations {
            result.errors.push(format!(
                "{} conversations exceed the budget of {}",
                rows.len(),
                budget.max_conversations
            ));
        }
        if result.messages_checked > budget.max_total_messages {
            result.errors.push(format!(
                "{} messages exceed the total budget of {}",
                result.messages_checked, budget.max_total_messages
            ));
        }
    }

    let mut last_seq = None;
    for action in actions {
        result.actions_checked += 1;
        if last_seq.is_some_and(|last| action.seq <= last) {
            result.errors.push(format!(
                "action {} is out of order after seq {}",
                action.seq,
                last_seq.unwrap_or_default()
            ));
        }
        last_seq = Some(action.seq);
        if let Some(queue) = &state.queue {
            if action.seq >= queue.next_seq {
                result.errors.push(format!(
                    "action {} is not below next_seq {}",
                    action.seq, queue.next_seq
                ));
            }
        }

        if action.kind() != ActionKind::SendMessage || action.terminal {
            continue;
        }
        let key = action.idempotency_key.as_str();
        let cached = rows
            .iter()
            .find(|row| row.conversation_id == action.conversation_id)
            .and_then(|row| row.page.find(key));
        match cached {
            Some(message) if message.state == MessageState::Pending => {}
            Some(message) => result.errors.push(format!(
                "{}: queued send {} has a {} message",
                action.conversation_id, key, message.state
            )),
            None => result.errors.push(format!(
                "{}: queued send {} has no cached message",
                action.conversation_id, key
            )),
        }
    }

    result
}

fn check_window(row: &ConversationSnapshot, errors: &mut Vec<String>) {
    let id = &row.conversation_id;
    if row.page.conversation_id != *id {
        errors.push(format!(
            "{}: window belongs to {}",
            id, row.page.conversation_id
        ));
    }

    let mut keys = HashSet::new();
    let mut ids = HashSet::new();
    for (index, message) in row.page.messages.iter().enumerate() {
        if message.conversation_id != *id {
            errors.push(format!(
                "{}: message {} belongs to {}",
                id, message.id, message.conversation_id
            ));
        }
        if index > 0 && row.page.messages[index - 1].order_key() >= message.order_key() {
            errors.push(format!("{}: message {} is out of order", id, message.id));
        }
        if !ids.insert(message.id.as_str()) {
            errors.push(format!("{}: duplicate id {}", id, message.id));
        }
        if let Some(key) = &message.idempotency_key {
            if !keys.insert(key.as_str()) {
                errors.push(format!("{}: duplicate idempotency key {}", id, key));
            }
        }
    }
}
