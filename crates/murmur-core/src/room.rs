//! Room identities and records.
//!
//! A private room between two users is keyed by `"<min>_<max>"`, so the id
//! can be rebuilt from the pair without a lookup and the pair can be
//! recovered from the id.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A user identity, supplied by the caller's session layer.
pub type UserId = i64;

/// Room id errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    /// Not of the form `"<min>_<max>"`.
    #[error("Invalid room id: {0:?}")]
    Malformed(String),

    /// Both identities are the same user.
    #[error("A room needs two distinct participants, got user {0} twice")]
    SelfRoom(UserId),

    /// Identities are positive integers.
    #[error("Invalid user id: {0}")]
    InvalidUser(UserId),
}

/// Canonical id of the room shared by two users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId {
    low: UserId,
    high: UserId,
}

impl RoomId {
    /// Build the canonical id for an unordered pair of users.
    ///
    /// # Errors
    ///
    /// Returns an error if the users are equal or not positive.
    pub fn new(user_a: UserId, user_b: UserId) -> Result<Self, RoomIdError> {
        for user in [user_a, user_b] {
            if user <= 0 {
                return Err(RoomIdError::InvalidUser(user));
            }
        }
        if user_a == user_b {
            return Err(RoomIdError::SelfRoom(user_a));
        }

        Ok(Self {
            low: user_a.min(user_b),
            high: user_a.max(user_b),
        })
    }

    /// Parse a canonical room id.
    ///
    /// Only the exact canonical spelling is accepted: `"7_3"` or `"03_7"`
    /// would alias room `"3_7"` and are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not canonical.
    pub fn parse(s: &str) -> Result<Self, RoomIdError> {
        let malformed = || RoomIdError::Malformed(s.to_string());

        let (low, high) = s.split_once('_').ok_or_else(malformed)?;
        let low: UserId = low.parse().map_err(|_| malformed())?;
        let high: UserId = high.parse().map_err(|_| malformed())?;

        let id = Self::new(low, high)?;
        if id.to_string() != s {
            return Err(malformed());
        }
        Ok(id)
    }

    /// The two participants, lowest id first.
    #[must_use]
    pub fn participants(&self) -> [UserId; 2] {
        [self.low, self.high]
    }

    /// Check whether a user is one of the two participants.
    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The participant that is not `user_id`.
    #[must_use]
    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.low {
            Some(self.high)
        } else if user_id == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.low, self.high)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// A persisted room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    /// Bumped on every send; orders the conversation list.
    pub last_activity: DateTime<Utc>,
}

/// A user's membership in a room, with their read watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub room_id: RoomId,
    pub user_id: UserId,
    /// `None` until the user first reads the room.
    pub last_read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_order_independent() {
        assert_eq!(RoomId::new(3, 7).unwrap(), RoomId::new(7, 3).unwrap());
        assert_eq!(RoomId::new(7, 3).unwrap().to_string(), "3_7");
    }

    #[test]
    fn test_room_id_numeric_order() {
        // 10 sorts after 9 numerically, not lexically
        assert_eq!(RoomId::new(10, 9).unwrap().to_string(), "9_10");
    }

    #[test]
    fn test_room_id_rejects_self_room() {
        assert_eq!(RoomId::new(4, 4), Err(RoomIdError::SelfRoom(4)));
        assert_eq!(RoomId::parse("4_4"), Err(RoomIdError::SelfRoom(4)));
    }

    #[test]
    fn test_room_id_rejects_invalid_users() {
        assert_eq!(RoomId::new(0, 4), Err(RoomIdError::InvalidUser(0)));
        assert_eq!(RoomId::new(4, -1), Err(RoomIdError::InvalidUser(-1)));
    }

    #[test]
    fn test_room_id_parse() {
        let id = RoomId::parse("3_7").unwrap();
        assert_eq!(id.participants(), [3, 7]);

        for bad in ["", "3", "3_", "_7", "3_7_9", "a_b", "7_3", "03_7", "3_+7", " 3_7"] {
            assert!(
                matches!(RoomId::parse(bad), Err(RoomIdError::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_room_id_other() {
        let id = RoomId::new(3, 7).unwrap();
        assert_eq!(id.other(3), Some(7));
        assert_eq!(id.other(7), Some(3));
        assert_eq!(id.other(5), None);
        assert!(id.contains(7));
        assert!(!id.contains(5));
    }

    #[test]
    fn test_room_id_serde() {
        let id = RoomId::new(3, 7).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"3_7\"");
        assert_eq!(serde_json::from_str::<RoomId>("\"3_7\"").unwrap(), id);
        assert!(serde_json::from_str::<RoomId>("\"7_3\"").is_err());
    }
}
