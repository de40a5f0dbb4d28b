//! Chat service.
//!
//! Ties the room directory, message log, read tracker and broker together
//! into the operations exposed to the HTTP layer. Callers are expected to
//! have verified identity and room membership already.

use chrono::{DateTime, Utc};
use murmur_protocol::{ChatEvent, MessagePayload};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{BroadcastReport, Broker, Subscription};
use crate::db::{now, Database};
use crate::directory::RoomDirectory;
use crate::error::ChatError;
use crate::log::{mark_all_read_with, MessageLog};
use crate::message::{validate_body, Message, MAX_BODY_CHARS};
use crate::read_tracker::{touch_last_read_with, ReadTracker};
use crate::room::{Room, RoomId, UserId};

/// Request size limits.
#[derive(Debug, Clone)]
pub struct ChatLimits {
    /// Maximum message body length, in characters.
    pub max_body_chars: usize,
    /// Page size when listing messages without an explicit limit.
    pub default_page_size: u32,
    /// Page size when listing conversations without an explicit limit.
    pub default_conversation_page_size: u32,
    /// Largest page any listing returns.
    pub max_page_size: u32,
}

impl Default for ChatLimits {
    fn default() -> Self {
        Self {
            max_body_chars: MAX_BODY_CHARS,
            default_page_size: 50,
            default_conversation_page_size: 12,
            max_page_size: 200,
        }
    }
}

impl ChatLimits {
    fn page(&self, requested: Option<u32>, default: u32) -> i64 {
        i64::from(requested.unwrap_or(default).clamp(1, self.max_page_size.max(1)))
    }
}

/// A persisted message plus the outcome of its live push.
#[derive(Debug, Clone)]
pub struct Sent {
    pub message: Message,
    pub delivery: BroadcastReport,
}

/// Outcome of marking a room read.
#[derive(Debug, Clone, Copy)]
pub struct MarkedRead {
    /// Messages newly stamped as read.
    pub marked: u64,
    pub delivery: BroadcastReport,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub room_id: RoomId,
    pub other_user_id: UserId,
    pub last_message: Option<MessagePayload>,
    pub unread_count: i64,
    pub last_activity: DateTime<Utc>,
}

/// Unread counts across all of a user's rooms.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnreadTotals {
    pub total: i64,
    pub rooms: BTreeMap<RoomId, i64>,
}

/// The chat service.
#[derive(Clone)]
pub struct ChatService {
    db: Database,
    rooms: RoomDirectory,
    log: MessageLog,
    reads: ReadTracker,
    broker: Arc<Broker>,
    limits: ChatLimits,
}

impl ChatService {
    /// Create a service over `db`, pushing live events through `broker`.
    #[must_use]
    pub fn new(db: Database, broker: Arc<Broker>, limits: ChatLimits) -> Self {
        Self {
            rooms: RoomDirectory::new(&db),
            log: MessageLog::new(&db),
            reads: ReadTracker::new(&db),
            db,
            broker,
            limits,
        }
    }

    /// Get or create the room shared by `user_id` and `other_user_id`,
    /// making both of them participants.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a self-room or non-positive id.
    pub async fn open_room(&self, user_id: UserId, other_user_id: UserId) -> Result<Room, ChatError> {
        RoomId::new(user_id, other_user_id)?;

        let room = self.rooms.get_or_create_room(user_id, other_user_id).await?;
        for participant in room.id.participants() {
            self.reads.join(&room.id, participant).await?;
        }

        debug!(room = %room.id, user = user_id, "Opened room");
        Ok(room)
    }

    /// Durably append a message and push it to connected participants.
    ///
    /// Nothing is persisted or pushed when this fails. A failed push never
    /// fails the send.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad room id or body, not-found if
    /// the room doesn't exist, and a storage error if the append fails.
    pub async fn send_message(&self, room_id: &str, sender_id: UserId, body: &str) -> Result<Sent, ChatError> {
        let room_id = RoomId::parse(room_id)?;
        let body = validate_body(body, self.limits.max_body_chars)?;
        self.rooms.get(&room_id).await?;

        let message = match self.log.append(&room_id, sender_id, body).await {
            Ok(message) => message,
            Err(e) => {
                error!(room = %room_id, user = sender_id, error = %e, "Failed to append message");
                return Err(e);
            }
        };

        if let Err(e) = self.rooms.touch(&room_id).await {
            warn!(room = %room_id, error = %e, "Failed to update room activity");
        }

        let delivery = self
            .broker
            .broadcast(&room_id, ChatEvent::new_message(MessagePayload::from(&message)));

        debug!(
            room = %room_id,
            user = sender_id,
            message_id = message.id,
            delivered = delivery.delivered,
            "Message sent"
        );
        Ok(Sent { message, delivery })
    }

    /// A page of a room's history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad room id and not-found if the
    /// room doesn't exist.
    pub async fn list_messages(
        &self,
        room_id: &str,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Message>, ChatError> {
        let room_id = RoomId::parse(room_id)?;
        self.rooms.get(&room_id).await?;

        let limit = self.limits.page(limit, self.limits.default_page_size);
        self.log.list(&room_id, limit, i64::from(offset)).await
    }

    /// A user's rooms, most recently active first, with previews.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn list_conversations(
        &self,
        user_id: UserId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let limit = self
            .limits
            .page(limit, self.limits.default_conversation_page_size);
        let rooms = self.rooms.rooms_for_user(user_id, limit, i64::from(offset)).await?;

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let Some(other_user_id) = room.id.other(user_id) else {
                continue;
            };
            let last_message = self.log.last_message(&room.id).await?;
            let unread_count = self.reads.unread_count(&room.id, user_id).await?;

            summaries.push(ConversationSummary {
                room_id: room.id,
                other_user_id,
                last_message: last_message.as_ref().map(MessagePayload::from),
                unread_count,
                last_activity: room.last_activity,
            });
        }
        Ok(summaries)
    }

    /// Mark everything in a room read for `reader_id`, then tell the
    /// room's connected participants.
    ///
    /// Message read stamps and the reader's watermark move together in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad room id, not-found if the room
    /// doesn't exist, and a storage error if the transaction fails.
    pub async fn mark_room_read(&self, room_id: &str, reader_id: UserId) -> Result<MarkedRead, ChatError> {
        let room_id = RoomId::parse(room_id)?;
        self.rooms.get(&room_id).await?;

        let at = now();
        let mut tx = self.db.pool().begin().await?;
        let marked = mark_all_read_with(&mut *tx, &room_id, reader_id, at).await?;
        touch_last_read_with(&mut *tx, &room_id, reader_id, at).await?;
        tx.commit().await?;

        let delivery = self
            .broker
            .broadcast(&room_id, ChatEvent::read_state_changed(room_id.to_string()));

        debug!(room = %room_id, user = reader_id, marked, "Room marked read");
        Ok(MarkedRead { marked, delivery })
    }

    /// Unread counts for every room the user participates in.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn unread_total(&self, user_id: UserId) -> Result<UnreadTotals, ChatError> {
        let rooms = self.reads.list_unread_totals(user_id).await?;
        let total = rooms.values().sum();
        Ok(UnreadTotals { total, rooms })
    }

    /// Register a live event stream for `user_id`.
    #[must_use]
    pub fn open_stream(&self, user_id: UserId) -> Subscription {
        info!(user = user_id, "Opening stream");
        self.broker.connect(user_id)
    }

    /// The broker pushing live events.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The configured limits.
    #[must_use]
    pub fn limits(&self) -> &ChatLimits {
        &self.limits
    }

    /// The read tracker.
    #[must_use]
    pub fn reads(&self) -> &ReadTracker {
        &self.reads
    }
}
