//! Room directory.
//!
//! Maps an unordered pair of users to their one room, creating it on first
//! contact. Creation is an insert-or-ignore followed by a read, so
//! concurrent first messages between the same pair converge on one row.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::db::{now, Database};
use crate::error::ChatError;
use crate::room::{Room, RoomId, UserId};

pub(crate) fn room_from_row(row: &SqliteRow) -> Result<Room, sqlx::Error> {
    let id: String = row.try_get("id")?;
    Ok(Room {
        id: RoomId::parse(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: row.try_get("created_at")?,
        last_activity: row.try_get("last_activity")?,
    })
}

/// Persistent directory of rooms.
#[derive(Clone, Debug)]
pub struct RoomDirectory {
    pool: SqlitePool,
}

impl RoomDirectory {
    /// Create a directory backed by the given database.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Return the room shared by two users, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair is invalid or storage fails.
    pub async fn get_or_create_room(&self, user_a: UserId, user_b: UserId) -> Result<Room, ChatError> {
        let id = RoomId::new(user_a, user_b)?;
        let at = now();

        let created = sqlx::query(
            r#"
            INSERT INTO rooms (id, created_at, last_activity)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(at)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if created {
            debug!(room = %id, "Created room");
        }

        self.get(&id).await
    }

    /// Bump a room's last activity to now.
    ///
    /// Returns `false` if the room doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn touch(&self, room_id: &RoomId) -> Result<bool, ChatError> {
        let updated = sqlx::query("UPDATE rooms SET last_activity = ? WHERE id = ?")
            .bind(now())
            .bind(room_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            warn!(room = %room_id, "Touched a room that does not exist");
        }
        Ok(updated > 0)
    }

    /// Get a room by id.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::RoomNotFound`] if there is no such room.
    pub async fn get(&self, room_id: &RoomId) -> Result<Room, ChatError> {
        let row = sqlx::query("SELECT id, created_at, last_activity FROM rooms WHERE id = ?")
            .bind(room_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;

        Ok(room_from_row(&row)?)
    }

    /// Rooms a user participates in, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn rooms_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Room>, ChatError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.created_at, r.last_activity
            FROM rooms r
            JOIN participants p ON p.room_id = r.id
            WHERE p.user_id = ?
            ORDER BY r.last_activity DESC, r.id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let rooms = rows
            .iter()
            .map(room_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    }
}
