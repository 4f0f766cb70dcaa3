use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreResult;

/// A private reflection the bot writes about one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub trait JournalStore: Send + Sync {
    fn create_entry(&self, conversation_id: &str, content: &str) -> StoreResult<JournalEntry>;

    /// Newest first.
    fn recent_entries(&self, conversation_id: &str, limit: usize)
        -> StoreResult<Vec<JournalEntry>>;

    /// Fails with [`super::StoreError::NotFound`] when no entry has this id.
    fn delete_entry(&self, id: &str) -> StoreResult<()>;
}
