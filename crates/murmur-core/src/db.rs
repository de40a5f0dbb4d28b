//! SQLite database bootstrap.
//!
//! One pool is shared by the room directory, message log and read tracker.
//! The store serializes conflicting writes; nothing here adds locking.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a writer waits for the database lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    created_at DATETIME NOT NULL,
    last_activity DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS participants (
    room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL,
    last_read_at DATETIME,
    PRIMARY KEY (room_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    sender_id INTEGER NOT NULL,
    body TEXT NOT NULL,
    sent_at DATETIME NOT NULL,
    read_at DATETIME
);
CREATE INDEX IF NOT EXISTS idx_messages_room_id ON messages(room_id, id);
"#;

/// Current time as stored in every timestamp column.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Handle to the chat database.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to a SQLite database and initialize the schema.
    ///
    /// The database file is created if it doesn't exist and opened in WAL
    /// mode; writers wait up to `BUSY_TIMEOUT` for the lock. `sqlite::memory:` URLs are pinned to a single
    /// connection, since every connection to an in-memory database sees its
    /// own empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database can't be
    /// opened or initialized.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await?
        };

        let db = Self { pool };
        db.init().await?;

        info!(url = %url, "Database ready");
        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to initialize.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Initialize the database schema.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// A unique database path under the system temp dir.
#[cfg(test)]
pub(crate) fn temp_db_path(tag: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("murmur-{tag}-{}-{n}.db", std::process::id()))
}

/// Remove a database file and its WAL sidecars.
#[cfg(test)]
pub(crate) fn remove_db_files(path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_schema() {
        let db = Database::in_memory().await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        assert!(names.contains(&"rooms"));
        assert!(names.contains(&"participants"));
        assert!(names.contains(&"messages"));
    }

    #[tokio::test]
    async fn test_file_database_uses_wal() {
        let path = temp_db_path("wal");
        let db = Database::connect(&format!("sqlite://{}", path.display()), 4)
            .await
            .unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        db.pool().close().await;
        remove_db_files(&path);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.init().await.unwrap();
    }
}
