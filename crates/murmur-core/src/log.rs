//! Append-only message log.
//!
//! Messages are ordered within a room by their log-assigned id only. Two
//! sends can share a `sent_at` value, so timestamps never order messages.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use tracing::{debug, trace};

use crate::db::{now, Database};
use crate::error::ChatError;
use crate::message::{Message, MessageId};
use crate::room::{RoomId, UserId};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, body, sent_at, read_at";

pub(crate) fn message_from_row(row: &SqliteRow) -> Result<Message, sqlx::Error> {
    let room_id: String = row.try_get("room_id")?;
    Ok(Message {
        id: row.try_get("id")?,
        room_id: RoomId::parse(&room_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        sender_id: row.try_get("sender_id")?,
        body: row.try_get("body")?,
        sent_at: row.try_get("sent_at")?,
        read_at: row.try_get("read_at")?,
    })
}

/// Stamp every unread message from other senders as read at `at`.
pub(crate) async fn mark_all_read_with<'e, E>(
    executor: E,
    room_id: &RoomId,
    reader_id: UserId,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE messages
        SET read_at = ?
        WHERE room_id = ?
          AND sender_id != ?
          AND read_at IS NULL
        "#,
    )
    .bind(at)
    .bind(room_id.to_string())
    .bind(reader_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Room-scoped, strictly ordered message store.
#[derive(Clone, Debug)]
pub struct MessageLog {
    pool: SqlitePool,
}

impl MessageLog {
    /// Create a log backed by the given database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Durably append a message, assigning the next id.
    ///
    /// # Errors
    ///
    /// Returns an error if the room doesn't exist or storage fails; nothing
    /// is persisted in that case.
    pub async fn append(
        &self,
        room_id: &RoomId,
        sender_id: UserId,
        body: &str,
    ) -> Result<Message, ChatError> {
        let sent_at = now();

        let result = sqlx::query(
            r#"
            INSERT INTO messages (room_id, sender_id, body, sent_at, read_at)
            VALUES (?, ?, ?, ?, NULL)
            "#,
        )
        .bind(room_id.to_string())
        .bind(sender_id)
        .bind(body)
        .bind(sent_at)
        .execute(&self.pool)
        .await?;

        let message = Message {
            id: result.last_insert_rowid(),
            room_id: *room_id,
            sender_id,
            body: body.to_string(),
            sent_at,
            read_at: None,
        };

        trace!(room = %room_id, message_id = message.id, "Appended message");
        Ok(message)
    }

    /// A page of a room's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list(
        &self,
        room_id: &RoomId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, ChatError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY id ASC LIMIT ? OFFSET ?"
        ))
        .bind(room_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Mark every message from other senders as read by `reader_id`.
    ///
    /// Already-read messages keep their original `read_at`, so repeating
    /// the call is a no-op. Returns the number of messages newly marked.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn mark_all_read(&self, room_id: &RoomId, reader_id: UserId) -> Result<u64, ChatError> {
        let marked = mark_all_read_with(&self.pool, room_id, reader_id, now()).await?;
        debug!(room = %room_id, reader = reader_id, marked, "Marked messages read");
        Ok(marked)
    }

    /// The most recent message in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn last_message(&self, room_id: &RoomId) -> Result<Option<Message>, ChatError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(room_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    /// Get a message by id.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::MessageNotFound`] if there is no such message.
    pub async fn get(&self, message_id: MessageId) -> Result<Message, ChatError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;

        Ok(message_from_row(&row)?)
    }

    /// Number of messages in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn count(&self, room_id: &RoomId) -> Result<i64, ChatError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id = ?")
            .bind(room_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
