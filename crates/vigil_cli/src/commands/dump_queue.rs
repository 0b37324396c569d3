//! Dump queue command implementation.

use super::PersistedState;
use serde::Serialize;
use std::path::Path;
use vigil_protocol::{ActionKind, ActionPayload, PendingAction, Timestamp};

/// Queued action representation for output.
#[derive(Debug, Serialize)]
pub struct ActionInfo {
    /// Enqueue order.
    pub seq: u64,
    /// Conversation id.
    pub conversation_id: String,
    /// Kind of action.
    pub kind: ActionKind,
    /// Idempotency key.
    pub idempotency_key: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Earliest time of the next attempt.
    pub next_retry_at: Timestamp,
    /// Whether the action was given up on.
    pub terminal: bool,
    /// Last failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Content length in characters (sends only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_chars: Option<usize>,
}

impl From<&PendingAction> for ActionInfo {
    fn from(action: &PendingAction) -> Self {
        let content_chars = match &action.payload {
            ActionPayload::SendMessage(message) => Some(message.content.chars().count()),
            ActionPayload::MarkRead { .. } => None,
        };
        Self {
            seq: action.seq,
            conversation_id: action.conversation_id.to_string(),
            kind: action.kind(),
            idempotency_key: action.idempotency_key.to_string(),
            retry_count: action.retry_count,
            next_retry_at: action.next_retry_at,
            terminal: action.terminal,
            last_error: action.last_error.clone(),
            content_chars,
        }
    }
}

/// Runs the dump-queue command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = PersistedState::load(path)?;
    let Some(queue) = state.queue else {
        return Err("Queue snapshot not found".into());
    };
    let actions = list_actions(&queue.actions, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&actions)?);
        }
        _ => {
            print_text_output(&actions, queue.actions.len());
        }
    }

    Ok(())
}

/// Converts up to `limit` actions for output.
pub fn list_actions(actions: &[PendingAction], limit: Option<usize>) -> Vec<ActionInfo> {
    actions
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(ActionInfo::from)
        .collect()
}

fn print_text_output(actions: &[ActionInfo], total: usize) {
    println!("Queue Actions ({} of {})", actions.len(), total);
    println!("==================");
    println!();

    for action in actions {
        print!(
            "#{:<5} {:<12} {} key={}",
            action.seq,
            action.kind.to_string(),
            action.conversation_id,
            action.idempotency_key
        );
        if let Some(chars) = action.content_chars {
            print!(" chars={}", chars);
        }
        if action.retry_count > 0 {
            print!(" retries={} next={}", action.retry_count, action.next_retry_at);
        }
        if action.terminal {
            print!(" TERMINAL");
        }
        println!();
        if let Some(err) = &action.last_error {
            println!("       last error: {}", err);
        }
    }
}
