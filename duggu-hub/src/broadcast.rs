//! Fan-out of chat envelopes to room members

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use duggu_core::models::{ConnectionId, Envelope, RoomId};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::registry::{ChatUser, RoomRegistry};

/// Who an outbound envelope goes to
#[derive(Debug, Clone)]
pub enum Audience {
    /// Members at delivery time
    Room(RoomId),
    /// A fixed member list, taken before the room went away
    Members(Vec<(ConnectionId, ChatUser)>),
}

/// One message queued by a dispatcher for delivery
#[derive(Debug, Clone)]
pub struct Outbound {
    pub envelope: Envelope,
    /// Sender's last-active membership id, stamped into `connectionid`;
    /// `None` stamps an empty id
    pub connection_id: Option<ConnectionId>,
    pub audience: Audience,
}

impl Outbound {
    #[must_use]
    pub fn to_room(envelope: Envelope, connection_id: Option<ConnectionId>) -> Self {
        let room_id = envelope.room_id;
        Self {
            envelope,
            connection_id,
            audience: Audience::Room(room_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Stamps and writes envelopes to every member of their audience.
pub struct Broadcaster {
    registry: Arc<RoomRegistry>,
    /// Last stamp handed out, in Unix milliseconds
    last_stamp: AtomicI64,
}

impl Broadcaster {
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            last_stamp: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// RFC 3339 server time with millisecond precision, never earlier than a
    /// stamp already handed out.
    pub fn stamp(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let millis = self.last_stamp.fetch_max(now, Ordering::AcqRel).max(now);
        DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Write `outbound` to its audience. One member failing does not stop the
    /// others; failed members are dropped from the registry, and members
    /// already closed are dropped before the write.
    pub async fn deliver(&self, outbound: Outbound) -> DeliveryReport {
        let Outbound {
            mut envelope,
            connection_id,
            audience,
        } = outbound;

        envelope.time = self.stamp();
        // never trust the client's own value
        envelope.connection_id = connection_id.map(|id| id.0).unwrap_or_default();

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id = %envelope.room_id, error = %e, "Failed to encode outbound envelope");
                return DeliveryReport::default();
            }
        };

        let members = match audience {
            Audience::Room(room_id) => {
                self.registry.prune_closed(room_id);
                self.registry.members_of(room_id)
            }
            Audience::Members(members) => members,
        };

        let writes = members.iter().map(|(id, user)| {
            let frame = frame.as_str();
            async move { (id, user.connection.write_frame(frame).await) }
        });

        let mut report = DeliveryReport::default();
        for (member_id, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        room_id = %envelope.room_id,
                        connection_id = %member_id,
                        error = %e,
                        "Failed to deliver to member, removing"
                    );
                    self.registry.remove_member(envelope.room_id, member_id);
                }
            }
        }

        debug!(
            room_id = %envelope.room_id,
            message_type = %envelope.message_type,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duggu_core::models::MessageType;
    use duggu_core::test_helpers::memory_connection;

    #[tokio::test]
    async fn test_text_reaches_every_member_stamped() {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let room = RoomId::new(7);

        let (a, sink_a) = memory_connection();
        let (b, sink_b) = memory_connection();
        let sender_id = registry.create_or_join(room, "alice", a);
        registry.create_or_join(room, "bob", b);

        let envelope = Envelope::new(MessageType::Text, room).with_data("hi");
        let report = broadcaster
            .deliver(Outbound::to_room(envelope, Some(sender_id.clone())))
            .await;
        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });

        for sink in [sink_a, sink_b] {
            let received = sink.envelopes();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].data, "hi");
            assert_eq!(received[0].connection_id, sender_id.as_str());
            assert!(DateTime::parse_from_rfc3339(&received[0].time).is_ok());
        }
    }

    #[tokio::test]
    async fn test_failed_member_is_pruned_others_still_served() {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let room = RoomId::new(2);

        let (good, good_sink) = memory_connection();
        let (bad, bad_sink) = memory_connection();
        registry.create_or_join(room, "good", good);
        registry.create_or_join(room, "bad", bad);
        bad_sink.fail_writes();

        let report = broadcaster
            .deliver(Outbound::to_room(Envelope::new(MessageType::Text, room).with_data("x"), None))
            .await;

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert_eq!(good_sink.frames().len(), 1);
        assert_eq!(registry.member_count(room), 1);
    }

    #[tokio::test]
    async fn test_client_supplied_connection_id_is_overwritten() {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let room = RoomId::new(4);

        let (bob, bob_sink) = memory_connection();
        let bob_id = registry.create_or_join(room, "bob", bob);

        let mut envelope = Envelope::new(MessageType::Text, room).with_data("it's me");
        envelope.connection_id = bob_id.as_str().to_string();
        broadcaster.deliver(Outbound::to_room(envelope, None)).await;

        let received = bob_sink.envelopes();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].connection_id, "");
    }

    #[tokio::test]
    async fn test_closed_member_is_skipped_not_failed() {
        let registry = Arc::new(RoomRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let room = RoomId::new(3);

        let (open, open_sink) = memory_connection();
        let (closed, closed_sink) = memory_connection();
        registry.create_or_join(room, "open", open);
        registry.create_or_join(room, "closed", closed.clone());
        closed.close().await;

        let report = broadcaster
            .deliver(Outbound::to_room(Envelope::new(MessageType::Text, room).with_data("x"), None))
            .await;

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });
        assert_eq!(open_sink.frames().len(), 1);
        assert!(closed_sink.frames().is_empty());
        assert_eq!(registry.member_count(room), 1);
    }

    #[tokio::test]
    async fn test_unknown_room_delivers_nothing() {
        let broadcaster = Broadcaster::new(Arc::new(RoomRegistry::new()));
        let report = broadcaster
            .deliver(Outbound::to_room(Envelope::new(MessageType::Text, RoomId::new(1)), None))
            .await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn test_stamps_never_go_backwards() {
        let broadcaster = Broadcaster::new(Arc::new(RoomRegistry::new()));
        let stamps: Vec<_> = (0..200).map(|_| broadcaster.stamp()).collect();
        let parsed: Vec<_> = stamps
            .iter()
            .map(|s| DateTime::parse_from_rfc3339(s).unwrap())
            .collect();
        assert!(parsed.windows(2).all(|w| w[0] <= w[1]));
    }
}
