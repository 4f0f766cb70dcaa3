//! Data-access contracts for the conversation loop.
//!
//! The three stores are independent leaves: nothing in `messages` knows about
//! `journal` or the reverse. Components receive them as `Arc<dyn ...>` so the
//! SQLite backend in [`crate::database`] can be swapped for test doubles.

pub mod directory;
pub mod journal;
pub mod messages;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;

pub use directory::{Conversation, Directory, User};
pub use journal::{JournalEntry, JournalStore};
pub use messages::{Message, MessageDirection, MessageStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("malformed row: {0}")]
    Malformed(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Current time at the precision the store keeps, so a freshly created record
/// compares equal to the same record read back.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that text ordering in SQL matches time ordering.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    value.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}
