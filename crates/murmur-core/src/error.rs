//! Error types for chat operations.

use thiserror::Error;

use crate::message::MessageId;
use crate::room::RoomIdError;

/// Chat errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed room id or invalid participant pair.
    #[error(transparent)]
    InvalidRoom(#[from] RoomIdError),

    /// Message body is empty after trimming.
    #[error("Message body cannot be empty")]
    EmptyBody,

    /// Message body exceeds the configured length.
    #[error("Message body has {len} characters, maximum is {max}")]
    BodyTooLong { len: usize, max: usize },

    /// Room does not exist.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Message does not exist.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// Storage failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ChatError {
    /// Request was rejected before touching storage.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChatError::InvalidRoom(_) | ChatError::EmptyBody | ChatError::BodyTooLong { .. }
        )
    }

    /// Referenced room or message does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChatError::RoomNotFound(_) | ChatError::MessageNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChatError::EmptyBody.is_validation());
        assert!(ChatError::from(RoomIdError::SelfRoom(3)).is_validation());
        assert!(!ChatError::EmptyBody.is_not_found());

        assert!(ChatError::RoomNotFound("3_7".into()).is_not_found());
        assert!(ChatError::MessageNotFound(1).is_not_found());

        let db = ChatError::from(sqlx::Error::RowNotFound);
        assert!(!db.is_validation());
        assert!(!db.is_not_found());
    }
}
