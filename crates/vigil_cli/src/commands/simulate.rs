//! Simulate command implementation.
//!
//! Drives a real [`SyncEngine`] against the mock backend: messages are sent
//! while offline, the connection comes back, and injected network failures
//! exercise the retry schedule on a manual clock.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vigil_protocol::{ContentType, Conversation, ConversationId, MessageState};
use vigil_storage::{DurableStore, FileStore, InMemoryStore};
use vigil_sync::mock::{MockBackend, MockCall, MockFailure, MockPushChannel, StaticIdentity};
use vigil_sync::{Clock, Collaborators, ManualClock, SyncConfig, SyncEngine, SyncResult};

const CONVERSATION: &str = "c-sim";
const MAX_ROUNDS: usize = 64;

/// Outcome of a simulation run.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SimulationReport {
    /// Messages handed to the engine.
    pub sent: usize,
    /// Messages the server confirmed.
    pub confirmed: usize,
    /// Messages that exhausted their retries.
    pub failed: usize,
    /// Messages still pending.
    pub pending: usize,
    /// Send calls that reached the backend.
    pub send_attempts: usize,
    /// Drain passes, the reconnect included.
    pub rounds: usize,
}

/// Runs the simulate command.
pub fn run(
    path: Option<&Path>,
    messages: usize,
    failures: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn DurableStore> = match path {
        Some(path) => Arc::new(FileStore::open(path)?),
        None => Arc::new(InMemoryStore::new()),
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(store, messages, failures))?;

    println!("Simulation");
    println!("==========");
    println!();
    println!("  Sent:          {}", report.sent);
    println!("  Confirmed:     {}", report.confirmed);
    println!("  Failed:        {}", report.failed);
    println!("  Pending:       {}", report.pending);
    println!("  Send attempts: {}", report.send_attempts);
    println!("  Drain rounds:  {}", report.rounds);
    if let Some(path) = path {
        println!();
        println!("State persisted to {:?}", path);
    }
    Ok(())
}

/// Sends `messages` offline, injects `failures` network errors, reconnects
/// and drains until the queue settles.
///
/// # Errors
///
/// Returns an error if the engine rejects a send or cannot persist.
pub async fn simulate(
    store: Arc<dyn DurableStore>,
    messages: usize,
    failures: usize,
) -> SyncResult<SimulationReport> {
    let clock = Arc::new(ManualClock::new(vigil_protocol::Timestamp::now()));
    let backend = Arc::new(MockBackend::with_clock(clock.clone()));
    backend.insert_conversation(Conversation::new(CONVERSATION, "me", "friend", clock.now()));

    let config = SyncConfig::default();
    let step = config.retry.max_delay;
    let engine = SyncEngine::new(
        config,
        Collaborators::new(
            Arc::new(StaticIdentity::new("me", "Me")),
            backend.clone(),
            Arc::new(MockPushChannel::new()),
            store,
        )
        .with_clock(clock.clone()),
    );
    let conversation = ConversationId::from(CONVERSATION);

    engine.refresh_conversations().await?;
    engine.on_connectivity_change(false).await;
    for n in 1..=messages {
        engine
            .send_message(
                &conversation,
                format!("Simulated prayer #{n}"),
                ContentType::Text,
                None,
            )
            .await?;
        clock.advance(Duration::from_millis(1));
    }
    info!(messages, failures, "queued messages offline");

    backend.fail_next(MockCall::Send, MockFailure::Network, failures);
    engine.on_connectivity_change(true).await;
    let mut rounds = 1;
    while !engine.queue().is_empty() && rounds < MAX_ROUNDS {
        clock.advance(step);
        engine.drain().await;
        rounds += 1;
    }

    let page = engine.messages(&conversation);
    let count = |state| page.messages.iter().filter(|m| m.state == state).count();
    let report = SimulationReport {
        sent: messages,
        confirmed: count(MessageState::Confirmed),
        failed: count(MessageState::Failed),
        pending: count(MessageState::Pending),
        send_attempts: backend.calls().send,
        rounds,
    };
    engine.persist()?;
    engine.shutdown();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn clean_run_confirms_everything() {
        let report = simulate(Arc::new(InMemoryStore::new()), 3, 0).await.unwrap();
        assert_eq!(report.confirmed, 3);
        assert_eq!(report.send_attempts, 3);
        assert_eq!(report.rounds, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let report = simulate(Arc::new(InMemoryStore::new()), 3, 2).await.unwrap();
        assert_eq!(report.confirmed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.send_attempts, 5);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_one_message() {
        let report = simulate(Arc::new(InMemoryStore::new()), 3, 10).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.pending, 0);
        assert_eq!(report.send_attempts, 12);
    }

    #[tokio::test]
    async fn persists_to_store_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let store: Arc<dyn DurableStore> = Arc::new(FileStore::open(&path).unwrap());
        simulate(store, 2, 0).await.unwrap();

        let state = crate::commands::PersistedState::load(&path).unwrap();
        assert_eq!(state.cache.map(|c| c.message_count()), Some(2));
        assert_eq!(state.queue.map(|q| q.actions.len()), Some(0));
    }
}
