//! Inspect command implementation.

use super::PersistedState;
use serde::Serialize;
use std::path::Path;
use vigil_protocol::{ConversationSnapshot, Message, MessageState, Timestamp};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Number of cached conversations.
    pub conversation_count: usize,
    /// Number of cached messages.
    pub message_count: usize,
    /// Messages waiting for the server.
    pub pending_count: usize,
    /// Messages that gave up.
    pub failed_count: usize,
    /// Actions in the offline queue.
    pub queued_actions: usize,
    /// Per-conversation statistics.
    pub conversations: Vec<ConversationStats>,
}

/// Statistics for a single cached conversation.
#[derive(Debug, Serialize)]
pub struct ConversationStats {
    /// Conversation id.
    pub id: String,
    /// Participant ids, if metadata was cached.
    pub participants: Vec<String>,
    /// Unread count.
    pub unread: u32,
    /// Whether the conversation is archived.
    pub archived: bool,
    /// Cached messages.
    pub messages: usize,
    /// Pending messages.
    pub pending: usize,
    /// Failed messages.
    pub failed: usize,
    /// Whether older history remains on the server.
    pub has_more: bool,
    /// Creation time of the newest cached message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_at: Option<Timestamp>,
    /// Message listing (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listing: Option<Vec<MessageInfo>>,
}

/// One cached message.
#[derive(Debug, Serialize)]
pub struct MessageInfo {
    /// Server id, or the local placeholder.
    pub id: String,
    /// Sender.
    pub sender: String,
    /// Delivery state.
    pub state: MessageState,
    /// Content type.
    pub content_type: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// First characters of the content.
    pub preview: String,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_messages: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = PersistedState::load(path)?;
    let result = summarize(path, &state, show_messages);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Builds the inspection result from loaded snapshots.
pub fn summarize(path: &Path, state: &PersistedState, show_messages: bool) -> InspectResult {
    let conversations: Vec<ConversationStats> = state
        .cache
        .iter()
        .flat_map(|cache| cache.conversations.iter())
        .map(|row| conversation_stats(row, show_messages))
        .collect();

    InspectResult {
        path: path.display().to_string(),
        conversation_count: conversations.len(),
        message_count: conversations.iter().map(|c| c.messages).sum(),
        pending_count: conversations.iter().map(|c| c.pending).sum(),
        failed_count: conversations.iter().map(|c| c.failed).sum(),
        queued_actions: state.queue.as_ref().map_or(0, |q| q.actions.len()),
        conversations,
    }
}

fn conversation_stats(row: &ConversationSnapshot, show_messages: bool) -> ConversationStats {
    let messages = &row.page.messages;
    let count_state = |state| messages.iter().filter(|m| m.state == state).count();
    let (participants, unread, archived) = match &row.conversation {
        Some(c) => (
            c.participant_ids.iter().map(ToString::to_string).collect(),
            c.unread_count,
            c.archived,
        ),
        None => (Vec::new(), 0, false),
    };

    ConversationStats {
        id: row.conversation_id.to_string(),
        participants,
        unread,
        archived,
        messages: messages.len(),
        pending: count_state(MessageState::Pending),
        failed: count_state(MessageState::Failed),
        has_more: row.page.has_more,
        newest_at: row.page.newest().map(|m| m.created_at),
        listing: show_messages.then(|| messages.iter().map(message_info).collect()),
    }
}

fn message_info(message: &Message) -> MessageInfo {
    MessageInfo {
        id: message.id.to_string(),
        sender: message.sender_id.to_string(),
        state: message.state,
        content_type: message.content_type.to_string(),
        created_at: message.created_at,
        preview: message.content.chars().take(40).collect(),
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Vigil Store Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Cache:");
    println!("  Conversations: {}", result.conversation_count);
    println!("  Messages:      {}", result.message_count);
    println!("  Pending:       {}", result.pending_count);
    println!("  Failed:        {}", result.failed_count);
    println!();
    println!("Queue:");
    println!("  Actions: {}", result.queued_actions);

    if result.conversations.is_empty() {
        return;
    }
    println!();
    println!("Conversations:");
    for c in &result.conversations {
        println!(
            "  [{}] {} messages ({} pending, {} failed), {} unread{}{}",
            c.id,
            c.messages,
            c.pending,
            c.failed,
            c.unread,
            if c.archived { ", archived" } else { "" },
            if c.has_more { ", more on server" } else { "" },
        );
        if !c.participants.is_empty() {
            println!("      participants: {}", c.participants.join(", "));
        }
        for m in c.listing.iter().flatten() {
            println!(
                "      {} {:<9} {:<5} {} {:?}",
                m.created_at,
                m.state.to_string(),
                m.content_type,
                m.sender,
                m.preview
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_protocol::{
        CachePage, CacheSnapshot, ContentType, Conversation, ConversationId, MessageId,
        QueueSnapshot,
    };

    fn message(id: &str, state: MessageState) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("c-1"),
            sender_id: "bob".into(),
            content: "Praying for your family this week".into(),
            content_type: ContentType::Text,
            media_url: None,
            media_duration_seconds: None,
            created_at: Timestamp::from_millis(10),
            read_at: None,
            idempotency_key: None,
            state,
        }
    }

    fn state() -> PersistedState {
        let mut page = CachePage::empty(ConversationId::from("c-1"));
        page.messages = vec![
            message("m-1", MessageState::Confirmed),
            message("K1", MessageState::Pending),
        ];
        let row = ConversationSnapshot {
            conversation_id: ConversationId::from("c-1"),
            conversation: Some(Conversation::new("c-1", "alice", "bob", Timestamp::EPOCH)),
            page,
        };
        PersistedState {
            cache: Some(CacheSnapshot::new(vec![row])),
            queue: Some(QueueSnapshot::new(2, Vec::new())),
        }
    }

    #[test]
    fn summarizes_counts() {
        let result = summarize(Path::new("/tmp/store"), &state(), false);
        assert_eq!(result.conversation_count, 1);
        assert_eq!(result.message_count, 2);
        assert_eq!(result.pending_count, 1);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.conversations[0].participants, ["alice", "bob"]);
        assert!(result.conversations[0].listing.is_none());
    }

    #[test]
    fn lists_messages_on_request() {
        let result = summarize(Path::new("/tmp/store"), &state(), true);
        let listing = result.conversations[0].listing.as_ref().unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].preview.chars().count(), 33);
    }

    #[test]
    fn json_omits_absent_listing() {
        let result = summarize(Path::new("/tmp/store"), &state(), false);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["conversations"][0].get("listing").is_none());
        assert_eq!(json["conversations"][0]["newest_at"], 10);
    }
}
