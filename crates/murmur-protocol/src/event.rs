//! Event types pushed to live stream connections.
//!
//! The set of kinds is closed: adding a kind means adding a variant here,
//! and every `match` over [`ChatEvent`] in the workspace has to handle it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Discriminator carried in the `kind` field of every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    ReadStateChanged,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::ReadStateChanged => "read_state_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_message" => Ok(EventKind::NewMessage),
            "read_state_changed" => Ok(EventKind::ReadStateChanged),
            other => Err(other.to_string()),
        }
    }
}

/// A persisted message as it travels inside a `new_message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Log-assigned id, strictly increasing within a room.
    pub id: i64,
    /// Canonical room id (`"<min>_<max>"`).
    pub room_id: String,
    /// Identity of the author.
    pub sender_id: i64,
    /// Message text.
    pub body: String,
    /// When the message was appended.
    pub sent_at: DateTime<Utc>,
    /// When the other participant read it, if they have.
    pub read_at: Option<DateTime<Utc>>,
}

/// An event delivered to a user's stream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ChatEvent {
    /// A message was durably appended to a room.
    NewMessage {
        room_id: String,
        message: MessagePayload,
    },

    /// Someone marked a room as read; unread badges should be refreshed.
    ReadStateChanged { room_id: String },
}

impl ChatEvent {
    /// Create a `new_message` event for a persisted message.
    #[must_use]
    pub fn new_message(message: MessagePayload) -> Self {
        ChatEvent::NewMessage {
            room_id: message.room_id.clone(),
            message,
        }
    }

    /// Create a `read_state_changed` event.
    #[must_use]
    pub fn read_state_changed(room_id: impl Into<String>) -> Self {
        ChatEvent::ReadStateChanged {
            room_id: room_id.into(),
        }
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ChatEvent::NewMessage { .. } => EventKind::NewMessage,
            ChatEvent::ReadStateChanged { .. } => EventKind::ReadStateChanged,
        }
    }

    /// Room the event refers to.
    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            ChatEvent::NewMessage { room_id, .. } | ChatEvent::ReadStateChanged { room_id } => {
                room_id
            }
        }
    }
}
