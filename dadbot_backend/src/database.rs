use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::store::{
    format_timestamp, now, parse_timestamp, Conversation, Directory, JournalEntry, JournalStore,
    Message, MessageDirection, MessageStore, StoreError, StoreResult, User,
};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed implementation of every store contract.
pub struct BotDatabase {
    conn: Mutex<Connection>,
}

/// Raw `messages` row, validated into a [`Message`] before leaving this module.
struct MessageRow {
    id: String,
    conversation_id: String,
    content: String,
    direction: String,
    journaled: i64,
    created_at: String,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> StoreResult<Self> {
        Ok(Message {
            direction: MessageDirection::from_db(&row.direction)?,
            created_at: parse_timestamp(row.created_at, 5)?,
            journaled: match row.journaled {
                0 => false,
                1 => true,
                other => {
                    return Err(StoreError::Malformed(format!(
                        "message '{}' has journaled flag {}",
                        row.id, other
                    )))
                }
            },
            id: row.id,
            conversation_id: row.conversation_id,
            content: row.content,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, content, direction, journaled, created_at";
const CONVERSATION_COLUMNS: &str = "id, user_id, tags, created_at, updated_at";

impl BotDatabase {
    fn lock_conn(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Create or open the database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::from_connection(conn)
    }

    /// Private scratch database, used by the test-chat path and tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .context("Failed to set sqlite busy timeout")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema().context("Failed to create schema")?;
        Ok(db)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                phone_number TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                content TEXT NOT NULL,
                direction TEXT NOT NULL,
                journaled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS journal_entries (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation_created ON messages(conversation_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_journal_conversation_created ON journal_entries(conversation_id, created_at DESC)",
            [],
        )?;

        Ok(())
    }

    fn read_message_rows(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Message>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    content: row.get(2)?,
                    direction: row.get(3)?,
                    journaled: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(Message::try_from).collect()
    }

    fn read_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Conversation, String)> {
        let tags_raw: String = row.get(2)?;
        Ok((
            Conversation {
                id: row.get(0)?,
                user_id: row.get(1)?,
                tags: BTreeSet::new(),
                created_at: parse_timestamp(row.get(3)?, 3)?,
                updated_at: parse_timestamp(row.get(4)?, 4)?,
            },
            tags_raw,
        ))
    }

    fn with_tags((mut conversation, tags_raw): (Conversation, String)) -> StoreResult<Conversation> {
        conversation.tags = serde_json::from_str(&tags_raw)?;
        Ok(conversation)
    }

    fn insert_conversation(
        conn: &Connection,
        user_id: &str,
        tags: &BTreeSet<String>,
    ) -> StoreResult<Conversation> {
        let created_at = now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            tags: tags.clone(),
            created_at,
            updated_at: created_at,
        };
        conn.execute(
            "INSERT INTO conversations (id, user_id, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation.id,
                conversation.user_id,
                serde_json::to_string(&conversation.tags)?,
                format_timestamp(created_at),
                format_timestamp(created_at),
            ],
        )?;
        Ok(conversation)
    }
}

impl Directory for BotDatabase {
    fn get_or_create_user(&self, phone_number: &str) -> StoreResult<User> {
        let created_at = format_timestamp(now());
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (id, phone_number, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                phone_number,
                created_at.clone(),
                created_at
            ],
        )?;

        let user = conn.query_row(
            "SELECT id, phone_number, created_at, updated_at FROM users WHERE phone_number = ?1",
            [phone_number],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    phone_number: row.get(1)?,
                    created_at: parse_timestamp(row.get(2)?, 2)?,
                    updated_at: parse_timestamp(row.get(3)?, 3)?,
                })
            },
        )?;
        Ok(user)
    }

    fn get_or_create_conversation(&self, user_id: &str) -> StoreResult<Conversation> {
        let conn = self.lock_conn()?;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE user_id = ?1
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1"
                ),
                [user_id],
                Self::read_conversation,
            )
            .optional()?;

        match existing {
            Some(raw) => Self::with_tags(raw),
            None => Self::insert_conversation(&conn, user_id, &BTreeSet::new()),
        }
    }

    fn create_conversation(
        &self,
        user_id: &str,
        tags: &BTreeSet<String>,
    ) -> StoreResult<Conversation> {
        let conn = self.lock_conn()?;
        Self::insert_conversation(&conn, user_id, tags)
    }

    fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            [conversation_id],
            Self::read_conversation,
        )
        .optional()?
        .map(Self::with_tags)
        .transpose()
    }

    fn list_conversations_for_user(&self, user_id: &str) -> StoreResult<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], Self::read_conversation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::with_tags).collect()
    }
}

impl MessageStore for BotDatabase {
    fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        direction: MessageDirection,
    ) -> StoreResult<Message> {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            direction,
            created_at: now(),
            journaled: false,
        };
        let created_at = format_timestamp(message.created_at);

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, content, direction, journaled, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                message.id,
                message.conversation_id,
                message.content,
                direction.as_db_str(),
                created_at.clone(),
            ],
        )?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id, created_at],
        )?;
        Ok(message)
    }

    fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        unconsumed_only: bool,
    ) -> StoreResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = if unconsumed_only {
            "AND journaled = 0"
        } else {
            ""
        };
        let conn = self.lock_conn()?;
        Self::read_message_rows(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 {filter}
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2"
            ),
            params![conversation_id, limit as i64],
        )
    }

    fn mark_journaled(&self, ids: &[String]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE messages SET journaled = 1
                 WHERE journaled = 0 AND id IN ({placeholders})"
            ),
            params_from_iter(ids.iter()),
        )?;
        Ok(changed)
    }

    fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let conn = self.lock_conn()?;
        Self::read_message_rows(
            &conn,
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            [conversation_id],
        )
    }
}

impl JournalStore for BotDatabase {
    fn create_entry(&self, conversation_id: &str, content: &str) -> StoreResult<JournalEntry> {
        let entry = JournalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            created_at: now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO journal_entries (id, conversation_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id,
                entry.conversation_id,
                entry.content,
                format_timestamp(entry.created_at),
            ],
        )?;
        Ok(entry)
    }

    fn recent_entries(&self, conversation_id: &str, limit: usize) -> StoreResult<Vec<JournalEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, content, created_at FROM journal_entries
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                Ok(JournalEntry {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_timestamp(row.get(3)?, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn delete_entry(&self, id: &str) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM journal_entries WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::not_found("journal entry", id));
        }
        Ok(())
    }
}
