//! Per-participant read watermarks and unread counts.
//!
//! A missing participant row reads the same as a null watermark: the user
//! has read nothing in that room yet.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use tracing::debug;

use crate::db::{now, Database};
use crate::error::ChatError;
use crate::room::{Participant, RoomId, UserId};

fn participant_from_row(row: &SqliteRow) -> Result<Participant, sqlx::Error> {
    let room_id: String = row.try_get("room_id")?;
    Ok(Participant {
        room_id: RoomId::parse(&room_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        user_id: row.try_get("user_id")?,
        last_read_at: row.try_get("last_read_at")?,
    })
}

/// Move a participant's watermark to `at`, creating the row if absent.
///
/// The watermark never moves backwards.
pub(crate) async fn touch_last_read_with<'e, E>(
    executor: E,
    room_id: &RoomId,
    user_id: UserId,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO participants (room_id, user_id, last_read_at)
        VALUES (?, ?, ?)
        ON CONFLICT(room_id, user_id) DO UPDATE SET
            last_read_at = CASE
                WHEN participants.last_read_at IS NULL
                  OR participants.last_read_at < excluded.last_read_at
                THEN excluded.last_read_at
                ELSE participants.last_read_at
            END
        "#,
    )
    .bind(room_id.to_string())
    .bind(user_id)
    .bind(at)
    .execute(executor)
    .await?;

    Ok(())
}

/// Tracks what each participant has read.
#[derive(Clone, Debug)]
pub struct ReadTracker {
    pool: SqlitePool,
}

impl ReadTracker {
    /// Create a tracker backed by the given database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Add a user to a room if they aren't already a participant.
    ///
    /// Returns `true` if the participant row was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the room doesn't exist or storage fails.
    pub async fn join(&self, room_id: &RoomId, user_id: UserId) -> Result<bool, ChatError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO participants (room_id, user_id, last_read_at)
            VALUES (?, ?, NULL)
            ON CONFLICT(room_id, user_id) DO NOTHING
            "#,
        )
        .bind(room_id.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if inserted {
            debug!(room = %room_id, user = user_id, "Participant joined");
        }
        Ok(inserted)
    }

    /// Get one participant record.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn participant(
        &self,
        room_id: &RoomId,
        user_id: UserId,
    ) -> Result<Option<Participant>, ChatError> {
        let row = sqlx::query(
            "SELECT room_id, user_id, last_read_at FROM participants WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(participant_from_row).transpose()?)
    }

    /// All participants of a room.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn participants(&self, room_id: &RoomId) -> Result<Vec<Participant>, ChatError> {
        let rows = sqlx::query(
            "SELECT room_id, user_id, last_read_at FROM participants WHERE room_id = ? ORDER BY user_id",
        )
        .bind(room_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let participants = rows
            .iter()
            .map(participant_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(participants)
    }

    /// Set a participant's watermark to now.
    ///
    /// # Errors
    ///
    /// Returns an error if the room doesn't exist or storage fails.
    pub async fn touch_last_read(&self, room_id: &RoomId, user_id: UserId) -> Result<(), ChatError> {
        touch_last_read_with(&self.pool, room_id, user_id, now()).await?;
        Ok(())
    }

    /// Messages from others sent after the user's watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn unread_count(&self, room_id: &RoomId, user_id: UserId) -> Result<i64, ChatError> {
        // '' sorts before every stored timestamp, standing in for "never read"
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM messages m
            WHERE m.room_id = ?
              AND m.sender_id != ?
              AND m.sent_at > COALESCE(
                  (SELECT p.last_read_at
                   FROM participants p
                   WHERE p.room_id = m.room_id AND p.user_id = ?),
                  '')
            "#,
        )
        .bind(room_id.to_string())
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Unread counts for every room the user participates in.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list_unread_totals(&self, user_id: UserId) -> Result<BTreeMap<RoomId, i64>, ChatError> {
        let rows = sqlx::query(
            r#"
            SELECT p.room_id AS room_id, COUNT(m.id) AS unread
            FROM participants p
            LEFT JOIN messages m
              ON m.room_id = p.room_id
             AND m.sender_id != p.user_id
             AND (p.last_read_at IS NULL OR m.sent_at > p.last_read_at)
            WHERE p.user_id = ?
            GROUP BY p.room_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut totals = BTreeMap::new();
        for row in rows {
            let room_id: String = row.try_get("room_id")?;
            let room_id = RoomId::parse(&room_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            totals.insert(room_id, row.try_get::<i64, _>("unread")?);
        }
        Ok(totals)
    }
}
