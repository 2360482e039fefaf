//! User Profiles
//!
//! Read-side projection of account data: the minimal public record embedded
//! in outbound message payloads. The account service owns registration; the
//! relay only looks profiles up (and `upsert` exists for that service and for
//! tests).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Public projection of a user, safe to embed in outbound payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: Option<String>,
}

impl UserProfile {
    /// Fallback projection for an id with no stored profile: the bare id.
    pub fn bare(user_id: &str) -> Self {
        UserProfile {
            user_id: user_id.to_string(),
            username: None,
        }
    }
}

/// Trait for user profile lookups.
pub trait UserDirectory: Send + Sync {
    /// Returns the public profile for a user, if one is stored.
    fn get(&self, user_id: &str) -> Option<UserProfile>;

    /// Inserts or updates a profile.
    fn upsert(&self, profile: UserProfile);

    /// Returns the stored profile, or the bare-id fallback.
    fn get_or_bare(&self, user_id: &str) -> UserProfile {
        self.get(user_id).unwrap_or_else(|| UserProfile::bare(user_id))
    }
}

// ============================================================================
// In-Memory Directory (for testing and development)
// ============================================================================

/// In-memory profile directory.
pub struct MemoryUserDirectory {
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl MemoryUserDirectory {
    /// Creates a new empty directory.
    pub fn new() -> Self {
        MemoryUserDirectory {
            profiles: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn get(&self, user_id: &str) -> Option<UserProfile> {
        let profiles = self.profiles.read().unwrap();
        profiles.get(user_id).cloned()
    }

    fn upsert(&self, profile: UserProfile) {
        let mut profiles = self.profiles.write().unwrap();
        profiles.insert(profile.user_id.clone(), profile);
    }
}

// ============================================================================
// SQLite Directory (for production)
// ============================================================================

/// SQLite-backed profile directory, reading the same database the account
/// service writes.
pub struct SqliteUserDirectory {
    conn: Mutex<Connection>,
}

impl SqliteUserDirectory {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                username TEXT
            )",
            [],
        )?;

        Ok(SqliteUserDirectory {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::open(":memory:")
    }
}

impl UserDirectory for SqliteUserDirectory {
    fn get(&self, user_id: &str) -> Option<UserProfile> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, username FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                })
            },
        )
        .ok()
    }

    fn upsert(&self, profile: UserProfile) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "INSERT INTO users (user_id, username) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET username = excluded.username",
            params![profile.user_id, profile.username],
        );
    }
}

/// Creates a user directory based on the backend type.
pub fn create_user_directory(
    backend: crate::store::StorageBackend,
    data_dir: Option<&Path>,
) -> Box<dyn UserDirectory> {
    match backend {
        crate::store::StorageBackend::Memory => Box::new(MemoryUserDirectory::new()),
        crate::store::StorageBackend::Sqlite => {
            let path = data_dir
                .map(|d| d.join("users.db"))
                .unwrap_or_else(|| std::path::PathBuf::from("users.db"));

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            Box::new(SqliteUserDirectory::open(&path).expect("Failed to open user database"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(user_id: &str, username: &str) -> UserProfile {
        UserProfile {
            user_id: user_id.to_string(),
            username: Some(username.to_string()),
        }
    }

    fn test_upsert_get_impl(directory: &dyn UserDirectory) {
        assert!(directory.get("alice").is_none());

        directory.upsert(profile("alice", "Alice"));
        assert_eq!(directory.get("alice"), Some(profile("alice", "Alice")));

        // Upsert overwrites
        directory.upsert(profile("alice", "Alice L."));
        assert_eq!(
            directory.get("alice").unwrap().username.as_deref(),
            Some("Alice L.")
        );
    }

    fn test_get_or_bare_impl(directory: &dyn UserDirectory) {
        let bare = directory.get_or_bare("ghost");
        assert_eq!(bare.user_id, "ghost");
        assert!(bare.username.is_none());

        directory.upsert(profile("bob", "Bob"));
        assert_eq!(
            directory.get_or_bare("bob").username.as_deref(),
            Some("Bob")
        );
    }

    #[test]
    fn test_memory_upsert_get() {
        test_upsert_get_impl(&MemoryUserDirectory::new());
    }

    #[test]
    fn test_memory_get_or_bare() {
        test_get_or_bare_impl(&MemoryUserDirectory::new());
    }

    #[test]
    fn test_sqlite_upsert_get() {
        test_upsert_get_impl(&SqliteUserDirectory::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_get_or_bare() {
        test_get_or_bare_impl(&SqliteUserDirectory::in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_profile_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("users.db");

        {
            let directory = SqliteUserDirectory::open(&db_path).unwrap();
            directory.upsert(profile("alice", "Alice"));
        }

        {
            let directory = SqliteUserDirectory::open(&db_path).unwrap();
            assert_eq!(directory.get("alice"), Some(profile("alice", "Alice")));
        }
    }
}
