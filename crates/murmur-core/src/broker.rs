//! Connection broker for live event fan-out.
//!
//! The broker keeps at most one live delivery queue per user. Broadcasting
//! to a room pushes the event onto the queue of every connected participant
//! without waiting on slow consumers: a full queue drops the event for that
//! recipient only. Offline participants are skipped; there is no backlog.

use dashmap::DashMap;
use murmur_protocol::ChatEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::room::{RoomId, UserId};

/// Default per-connection queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Events buffered per connection before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Identifies one registration, so a stale stream can't remove its
/// replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

struct Registration {
    connection_id: ConnectionId,
    sender: mpsc::Sender<Arc<ChatEvent>>,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Participants whose queue accepted the event.
    pub delivered: usize,
    /// Participants with no live stream.
    pub offline: usize,
    /// Participants whose queue was full or closed.
    pub dropped: usize,
}

/// Broker statistics.
#[derive(Debug, Clone, Copy)]
pub struct BrokerStats {
    /// Number of users with a live stream.
    pub connection_count: usize,
}

/// Registry of live per-user delivery queues.
///
/// All registry access goes through a sharded concurrent map, so connects,
/// disconnects and broadcasts from many tasks never observe a torn entry.
pub struct Broker {
    registry: DashMap<UserId, Registration>,
    next_id: AtomicU64,
    config: BrokerConfig,
}

impl Broker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            registry: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Register a live queue for `user_id`.
    ///
    /// An existing registration for the same user is replaced and its
    /// queue closed, ending the old stream.
    #[must_use]
    pub fn connect(self: &Arc<Self>, user_id: UserId) -> Subscription {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        let previous = self.registry.insert(
            user_id,
            Registration {
                connection_id,
                sender,
            },
        );

        match previous {
            Some(old) => debug!(
                user = user_id,
                connection = %connection_id,
                replaced = %old.connection_id,
                "Replaced live stream"
            ),
            None => debug!(user = user_id, connection = %connection_id, "Connected"),
        }

        Subscription {
            user_id,
            connection_id,
            receiver,
            broker: Arc::clone(self),
        }
    }

    /// Remove whatever registration `user_id` has.
    ///
    /// Returns `true` if one was removed.
    pub fn disconnect(&self, user_id: UserId) -> bool {
        let removed = self.registry.remove(&user_id).is_some();
        if removed {
            debug!(user = user_id, "Disconnected");
        }
        removed
    }

    /// Remove the registration for `user_id` only if it is still
    /// `connection_id`.
    pub fn release(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = self
            .registry
            .remove_if(&user_id, |_, reg| reg.connection_id == connection_id)
            .is_some();

        if removed {
            debug!(user = user_id, connection = %connection_id, "Released live stream");
        } else {
            trace!(user = user_id, connection = %connection_id, "Stale release ignored");
        }
        removed
    }

    /// Push `event` to every connected participant of `room_id`.
    pub fn broadcast(&self, room_id: &RoomId, event: ChatEvent) -> BroadcastReport {
        let event = Arc::new(event);
        let mut report = BroadcastReport::default();

        for user_id in room_id.participants() {
            let Some(reg) = self.registry.get(&user_id) else {
                report.offline += 1;
                debug!(room = %room_id, user = user_id, "Recipient offline");
                continue;
            };

            match reg.sender.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(
                        room = %room_id,
                        user = user_id,
                        connection = %reg.connection_id,
                        kind = %event.kind(),
                        "Delivery queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    debug!(room = %room_id, user = user_id, "Delivery queue closed");
                }
            }
        }

        trace!(
            room = %room_id,
            kind = %event.kind(),
            delivered = report.delivered,
            offline = report.offline,
            dropped = report.dropped,
            "Broadcast"
        );
        report
    }

    /// Check whether `user_id` has a live stream.
    #[must_use]
    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.registry.contains_key(&user_id)
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connection_count: self.registry.len(),
        }
    }

    /// Drop every registration, ending all live streams.
    pub fn shutdown(&self) {
        let count = self.registry.len();
        self.registry.clear();
        info!(connections = count, "Broker shut down");
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// A user's live event stream.
///
/// Dropping the subscription releases its registration unless it has
/// already been replaced by a newer one.
pub struct Subscription {
    user_id: UserId,
    connection_id: ConnectionId,
    receiver: mpsc::Receiver<Arc<ChatEvent>>,
    broker: Arc<Broker>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the registration has
    /// been replaced, disconnected or shut down.
    pub async fn recv(&mut self) -> Option<Arc<ChatEvent>> {
        self.receiver.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Arc<ChatEvent>> {
        self.receiver.try_recv().ok()
    }

    /// The subscribed user.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// This registration's id.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("user_id", &self.user_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.release(self.user_id, self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new(3, 7).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_participant() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.connect(7);

        let report = broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.offline, 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.room_id(), "3_7");
    }

    #[tokio::test]
    async fn test_broadcast_ignores_non_participants() {
        let broker = Arc::new(Broker::new());
        let mut outsider = broker.connect(9);

        broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        assert!(outsider.try_recv().is_none());
    }

    #[test]
    fn test_disconnect_stops_delivery() {
        let broker = Arc::new(Broker::new());
        let _sub = broker.connect(3);
        assert!(broker.is_connected(3));

        assert!(broker.disconnect(3));
        assert!(!broker.is_connected(3));
        assert!(!broker.disconnect(3));

        let report = broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.offline, 2);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_and_closes_old_queue() {
        let broker = Arc::new(Broker::new());
        let mut first = broker.connect(3);
        let mut second = broker.connect(3);
        assert_ne!(first.connection_id(), second.connection_id());
        assert_eq!(broker.stats().connection_count, 1);

        assert!(first.recv().await.is_none());

        broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        assert!(second.recv().await.is_some());
    }

    #[test]
    fn test_stale_drop_keeps_replacement() {
        let broker = Arc::new(Broker::new());
        let first = broker.connect(3);
        let second = broker.connect(3);

        drop(first);
        assert!(broker.is_connected(3));

        drop(second);
        assert!(!broker.is_connected(3));
    }

    #[test]
    fn test_full_queue_drops_event() {
        let broker = Arc::new(Broker::with_config(BrokerConfig { queue_capacity: 1 }));
        let mut sub = broker.connect(7);

        let first = broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        let second = broker.broadcast(&room(), ChatEvent::read_state_changed("3_7"));
        assert_eq!(first.delivered, 1);
        assert_eq!(second.dropped, 1);

        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ends_streams() {
        let broker = Arc::new(Broker::new());
        let mut a = broker.connect(3);
        let mut b = broker.connect(7);

        broker.shutdown();
        assert_eq!(broker.stats().connection_count, 0);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "conn_42");
    }
}
