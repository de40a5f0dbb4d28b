//! # murmur-core
//!
//! Rooms, message history, read tracking and live fan-out for murmur.
//!
//! This crate provides the building blocks behind every chat operation:
//!
//! - **RoomDirectory** - Canonical two-party rooms, created idempotently
//! - **MessageLog** - Append-only, id-ordered message history per room
//! - **ReadTracker** - Per-participant watermarks and unread counts
//! - **Broker** - One live event queue per connected user
//! - **ChatService** - The operations the HTTP layer exposes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Sender    │────▶│ ChatService │────▶│ MessageLog  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │  (after the append)
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Broker    │────▶│ Subscription│
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod broker;
pub mod chat;
pub mod db;
pub mod directory;
pub mod error;
pub mod log;
pub mod message;
pub mod read_tracker;
pub mod room;

pub use broker::{BroadcastReport, Broker, BrokerConfig, BrokerStats, ConnectionId, Subscription};
pub use chat::{ChatLimits, ChatService, ConversationSummary, MarkedRead, Sent, UnreadTotals};
pub use db::Database;
pub use directory::RoomDirectory;
pub use error::ChatError;
pub use log::MessageLog;
pub use message::{validate_body, Message, MessageId, MAX_BODY_CHARS};
pub use read_tracker::ReadTracker;
pub use room::{Participant, Room, RoomId, RoomIdError, UserId};
