//! Engine notifications for UI consumers.

use tokio::sync::broadcast;
use tracing::trace;
use vigil_protocol::{ActionKind, Conversation, ConversationId, Message, ReadReceipt};

/// Something observable changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A cached message was inserted or changed.
    MessageUpdated {
        /// Conversation of the message.
        conversation_id: ConversationId,
        /// The message as now cached.
        message: Message,
    },
    /// A send gave up; the message is now `Failed`.
    MessageFailed {
        /// Conversation of the message.
        conversation_id: ConversationId,
        /// The failed message.
        message: Message,
        /// Last error.
        reason: String,
    },
    /// A non-send action gave up.
    ActionFailed {
        /// Conversation of the action.
        conversation_id: ConversationId,
        /// Kind of action.
        kind: ActionKind,
        /// Last error.
        reason: String,
    },
    /// The other participant read messages.
    ReadReceipt {
        /// The receipt.
        receipt: ReadReceipt,
        /// Messages newly stamped as read.
        stamped: usize,
    },
    /// Conversation metadata changed.
    ConversationUpdated(Conversation),
    /// Conversations dropped from the cache to stay within budget.
    ConversationsEvicted(Vec<ConversationId>),
    /// Connectivity changed.
    Connectivity {
        /// Whether the engine is online.
        online: bool,
    },
}

/// Broadcasts [`SyncEvent`]s to any number of receivers.
///
/// Emitting never blocks; slow receivers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns a new receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Sends an event; dropped when nobody listens.
    pub fn emit(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            trace!("no event receivers");
        }
    }
}
