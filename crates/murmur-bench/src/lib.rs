//! Shared fixtures for murmur benchmarks.

use chrono::Utc;
use murmur_protocol::{ChatEvent, MessagePayload};

/// A `new_message` event for room `3_7` with a body of `body_len` bytes.
#[must_use]
pub fn message_event(body_len: usize) -> ChatEvent {
    ChatEvent::new_message(MessagePayload {
        id: 1,
        room_id: "3_7".to_string(),
        sender_id: 3,
        body: "x".repeat(body_len),
        sent_at: Utc::now(),
        read_at: None,
    })
}
