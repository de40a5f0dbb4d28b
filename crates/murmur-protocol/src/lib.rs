//! # murmur-protocol
//!
//! Wire protocol definitions for murmur live chat streams.
//!
//! A stream connection carries one self-delimited record per event. Every
//! record has a `kind` tag and a JSON payload matching one of the shapes of
//! [`ChatEvent`].
//!
//! ## Event kinds
//!
//! - `new_message` - a message was appended to one of the user's rooms
//! - `read_state_changed` - read progress changed in a room (badge refresh)
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, ChatEvent};
//!
//! let event = ChatEvent::read_state_changed("3_7");
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use event::{ChatEvent, EventKind, MessagePayload};
pub use version::{Version, PROTOCOL_VERSION, VERSION_HEADER};
