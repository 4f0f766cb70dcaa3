use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StoreError, StoreResult};

/// Which side of the conversation a text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageDirection {
    /// From the human.
    Incoming,
    /// From the bot.
    Outgoing,
}

impl MessageDirection {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageDirection::Incoming => "INCOMING",
            MessageDirection::Outgoing => "OUTGOING",
        }
    }

    pub fn from_db(raw: &str) -> StoreResult<Self> {
        match raw.trim() {
            "INCOMING" => Ok(MessageDirection::Incoming),
            "OUTGOING" => Ok(MessageDirection::Outgoing),
            other => Err(StoreError::Malformed(format!(
                "unknown message direction '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub direction: MessageDirection,
    pub created_at: DateTime<Utc>,
    /// Set once the message has been folded into a journal entry.
    pub journaled: bool,
}

/// Append-only message log, one per conversation.
pub trait MessageStore: Send + Sync {
    fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        direction: MessageDirection,
    ) -> StoreResult<Message>;

    /// Newest first. With `unconsumed_only` the journaled messages are skipped.
    fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        unconsumed_only: bool,
    ) -> StoreResult<Vec<Message>>;

    /// Flip `journaled` to true. Already-journaled ids are left alone; returns
    /// the number of rows that actually changed.
    fn mark_journaled(&self, ids: &[String]) -> StoreResult<usize>;

    /// Whole transcript, oldest first.
    fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>>;
}
