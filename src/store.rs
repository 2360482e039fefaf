//! Message Storage
//!
//! Durable store for chat messages. Every accepted send is persisted here
//! before the sender is acknowledged; messages stay stored whether or not the
//! recipient was online, and are never deleted by the relay.
//! Supports both in-memory (for testing) and SQLite (for production).

use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};

/// A message handed to the store for persistence.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    /// Creation time in Unix milliseconds. The store assigns the server
    /// clock when absent.
    pub timestamp_ms: Option<u64>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Unique message id.
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    /// Creation time in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Set only through [`MessageStore::mark_read`].
    pub is_read: bool,
}

fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl StoredMessage {
    fn from_new(msg: NewMessage) -> Self {
        StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            text: msg.text,
            timestamp_ms: msg.timestamp_ms.unwrap_or_else(unix_now_millis),
            is_read: false,
        }
    }
}

/// Trait for message storage backends.
///
/// Failures surface as strings so the relay can echo the underlying detail
/// back to the sender in its error event.
pub trait MessageStore: Send + Sync {
    /// Persists a message, assigning id and timestamp, and returns the stored
    /// record.
    fn create(&self, msg: NewMessage) -> Result<StoredMessage, String>;

    /// Returns every message exchanged between the two users, in either
    /// direction, ordered by timestamp.
    fn history(&self, user_a: &str, user_b: &str) -> Vec<StoredMessage>;

    /// Marks all unread messages from `sender_id` to `receiver_id` as read.
    /// Returns the number of messages updated.
    fn mark_read(&self, sender_id: &str, receiver_id: &str) -> usize;

    /// Returns the total number of stored messages.
    fn message_count(&self) -> usize;
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

/// In-memory message store.
pub struct MemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        MemoryMessageStore {
            messages: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryMessageStore {
    fn create(&self, msg: NewMessage) -> Result<StoredMessage, String> {
        let stored = StoredMessage::from_new(msg);
        let mut messages = self.messages.write().unwrap();
        messages.push(stored.clone());
        Ok(stored)
    }

    fn history(&self, user_a: &str, user_b: &str) -> Vec<StoredMessage> {
        let messages = self.messages.read().unwrap();
        let mut result: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| {
                (m.sender_id == user_a && m.receiver_id == user_b)
                    || (m.sender_id == user_b && m.receiver_id == user_a)
            })
            .cloned()
            .collect();
        result.sort_by_key(|m| m.timestamp_ms);
        result
    }

    fn mark_read(&self, sender_id: &str, receiver_id: &str) -> usize {
        let mut messages = self.messages.write().unwrap();
        let mut updated = 0;
        for m in messages.iter_mut() {
            if m.sender_id == sender_id && m.receiver_id == receiver_id && !m.is_read {
                m.is_read = true;
                updated += 1;
            }
        }
        updated
    }

    fn message_count(&self) -> usize {
        let messages = self.messages.read().unwrap();
        messages.len()
    }
}

/// In-memory store that rejects every write. Test-only, for exercising the
/// persistence-failure path end to end.
pub struct FailingMessageStore {
    reason: String,
}

impl FailingMessageStore {
    pub fn new(reason: &str) -> Self {
        FailingMessageStore {
            reason: reason.to_string(),
        }
    }
}

impl MessageStore for FailingMessageStore {
    fn create(&self, _msg: NewMessage) -> Result<StoredMessage, String> {
        Err(self.reason.clone())
    }

    fn history(&self, _user_a: &str, _user_b: &str) -> Vec<StoredMessage> {
        Vec::new()
    }

    fn mark_read(&self, _sender_id: &str, _receiver_id: &str) -> usize {
        0
    }

    fn message_count(&self) -> usize {
        0
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent message store.
pub struct SqliteMessageStore {
    conn: Mutex<Connection>,
}

impl SqliteMessageStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        // WAL allows readers and writers to operate concurrently
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        // Index for participant-pair history queries
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_pair
             ON messages(sender_id, receiver_id, timestamp_ms)",
            [],
        )?;

        Ok(SqliteMessageStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }
}

impl MessageStore for SqliteMessageStore {
    fn create(&self, msg: NewMessage) -> Result<StoredMessage, String> {
        let stored = StoredMessage::from_new(msg);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, sender_id, receiver_id, text, timestamp_ms, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stored.id,
                stored.sender_id,
                stored.receiver_id,
                stored.text,
                stored.timestamp_ms as i64,
                stored.is_read
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(stored)
    }

    fn history(&self, user_a: &str, user_b: &str) -> Vec<StoredMessage> {
        let conn = self.conn.lock().unwrap();
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, sender_id, receiver_id, text, timestamp_ms, is_read
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY timestamp_ms ASC",
        ) else {
            return Vec::new();
        };

        stmt.query_map(params![user_a, user_b], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                text: row.get(3)?,
                timestamp_ms: row.get::<_, i64>(4)? as u64,
                is_read: row.get(5)?,
            })
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    }

    fn mark_read(&self, sender_id: &str, receiver_id: &str) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            params![sender_id, receiver_id],
        )
        .unwrap_or(0)
    }

    fn message_count(&self) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a message store based on the backend type.
pub fn create_message_store(
    backend: StorageBackend,
    data_dir: Option<&Path>,
) -> Box<dyn MessageStore> {
    match backend {
        StorageBackend::Memory => Box::new(MemoryMessageStore::new()),
        StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("messages.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("messages.db"));

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Box::new(SqliteMessageStore::open(&path).expect("Failed to open message database"))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
