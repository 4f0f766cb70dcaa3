use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreResult;

/// Someone texting the bot, keyed by phone number (or a simulator id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Users and their conversations. Both are created on demand and never removed.
pub trait Directory: Send + Sync {
    fn get_or_create_user(&self, phone_number: &str) -> StoreResult<User>;

    /// The user's oldest conversation, or a fresh one with no tags.
    fn get_or_create_conversation(&self, user_id: &str) -> StoreResult<Conversation>;

    fn create_conversation(&self, user_id: &str, tags: &BTreeSet<String>)
        -> StoreResult<Conversation>;

    fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;

    /// Newest first.
    fn list_conversations_for_user(&self, user_id: &str) -> StoreResult<Vec<Conversation>>;
}
