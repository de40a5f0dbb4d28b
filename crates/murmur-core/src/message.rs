//! Message records and body validation.

use chrono::{DateTime, Utc};
use murmur_protocol::MessagePayload;
use serde::Serialize;

use crate::error::ChatError;
use crate::room::{RoomId, UserId};

/// Log-assigned message identifier.
pub type MessageId = i64;

/// Default maximum body length, in characters.
pub const MAX_BODY_CHARS: usize = 5000;

/// A message in a room's log.
///
/// Immutable once appended, except for `read_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl From<&Message> for MessagePayload {
    fn from(message: &Message) -> Self {
        MessagePayload {
            id: message.id,
            room_id: message.room_id.to_string(),
            sender_id: message.sender_id,
            body: message.body.clone(),
            sent_at: message.sent_at,
            read_at: message.read_at,
        }
    }
}

/// Validate a message body, returning it with surrounding whitespace
/// trimmed.
///
/// # Errors
///
/// Returns an error if the trimmed body is empty or longer than
/// `max_chars` characters.
pub fn validate_body(body: &str, max_chars: usize) -> Result<&str, ChatError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ChatError::EmptyBody);
    }

    let len = body.chars().count();
    if len > max_chars {
        return Err(ChatError::BodyTooLong { len, max: max_chars });
    }

    Ok(body)
}
