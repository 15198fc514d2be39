//! Per-connection message dispatch
//!
//! Every client socket gets one read loop ([`MessageDispatcher::run`]) and one
//! write task. The read loop decodes frames in arrival order and applies room
//! and SFU side effects before anything is queued, so a join is visible to the
//! room before the messages that follow it. The write task drains the queue
//! through the [`Broadcaster`].
//!
//! The transport is read through [`FrameStream`] so the loop runs the same
//! against a WebSocket or an in-memory script.

use std::sync::Arc;

use duggu_core::auth::Identity;
use duggu_core::models::{ConnectionId, Envelope, MessageType, PeerId, RoomId};
use duggu_core::Connection;
use duggu_hub::{Audience, Broadcaster, Outbound, RoomRegistry};
use duggu_sfu::{SfuError, SfuManager};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read half of a client transport
#[async_trait::async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<String, String>>;
}

/// What one socket has created and must release on disconnect
struct Session {
    connection: Connection,
    identity: Identity,
    memberships: Vec<(RoomId, ConnectionId)>,
    peers: Vec<(RoomId, PeerId)>,
    /// Membership id of the most recent join, stamped on outbound messages
    last_connection_id: Option<ConnectionId>,
    /// Name an anonymous client last joined with
    joined_as: Option<String>,
}

impl Session {
    fn new(connection: Connection, identity: Identity) -> Self {
        Self {
            connection,
            identity,
            memberships: Vec::new(),
            peers: Vec::new(),
            last_connection_id: None,
            joined_as: None,
        }
    }

    /// Verified name when there is one, else what the client claims or last
    /// joined with.
    fn display_name(&self, claimed: &str) -> String {
        if self.identity.user_id.is_some() {
            return self.identity.display_name.clone();
        }
        if !claimed.is_empty() {
            return claimed.to_string();
        }
        self.joined_as
            .clone()
            .unwrap_or_else(|| self.identity.display_name.clone())
    }

    fn forget_room(&mut self, room_id: RoomId) {
        self.memberships.retain(|(room, _)| *room != room_id);
        self.peers.retain(|(room, _)| *room != room_id);
        if self.memberships.is_empty() {
            self.last_connection_id = None;
        }
    }
}

#[derive(Clone)]
pub struct MessageDispatcher {
    broadcaster: Arc<Broadcaster>,
    sfu: Arc<SfuManager>,
    queue_capacity: usize,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new(broadcaster: Arc<Broadcaster>, sfu: Arc<SfuManager>, queue_capacity: usize) -> Self {
        Self {
            broadcaster,
            sfu,
            queue_capacity: queue_capacity.max(1),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        self.broadcaster.registry()
    }

    #[must_use]
    pub fn sfu(&self) -> &Arc<SfuManager> {
        &self.sfu
    }

    /// Serve one client until its stream ends or fails.
    ///
    /// This is the only place a client transport is closed: the outbound queue
    /// is drained first, then the socket's memberships and media peers are
    /// released.
    pub async fn run<S: FrameStream>(&self, connection: Connection, identity: Identity, stream: &mut S) {
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.queue_capacity);

        let broadcaster = Arc::clone(&self.broadcaster);
        let writer = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                broadcaster.deliver(outbound).await;
            }
        });

        let mut session = Session::new(connection, identity);
        info!(
            connection = %session.connection.id(),
            user = %session.identity.display_name,
            "Client connected"
        );

        loop {
            let frame = match stream.recv().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(connection = %session.connection.id(), error = %e, "Transport read failed");
                    break;
                }
                None => {
                    debug!(connection = %session.connection.id(), "Client closed the stream");
                    break;
                }
            };

            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(connection = %session.connection.id(), error = %e, "Dropping malformed frame");
                    continue;
                }
            };

            if let Some(outbound) = self.handle(&mut session, envelope).await {
                if tx.send(outbound).await.is_err() {
                    warn!(connection = %session.connection.id(), "Outbound queue closed");
                    break;
                }
            }
        }

        drop(tx);
        if let Err(e) = writer.await {
            warn!(connection = %session.connection.id(), error = %e, "Outbound writer panicked");
        }
        self.release(&session).await;
        session.connection.close().await;

        info!(connection = %session.connection.id(), "Client disconnected");
    }

    /// Apply the side effects of one envelope; returns what to broadcast.
    async fn handle(&self, session: &mut Session, mut envelope: Envelope) -> Option<Outbound> {
        let room_id = envelope.room_id;

        match envelope.message_type {
            MessageType::Text | MessageType::Request => {}
            MessageType::JoinRoom => {
                let name = session.display_name(&envelope.user);
                let connection_id =
                    self.registry()
                        .create_or_join(room_id, name.clone(), session.connection.clone());
                session.memberships.push((room_id, connection_id.clone()));
                session.last_connection_id = Some(connection_id);
                session.joined_as = Some(name);
            }
            MessageType::LeaveRoom => return self.leave(session, envelope).await,
            MessageType::VideoCall => self.video_call(session, room_id).await,
            MessageType::Candidate => {
                let peer_id = PeerId::from(envelope.peer_id.as_str());
                if let Err(e) = self.sfu.apply_ice_candidate(room_id, &peer_id, &envelope.data).await {
                    warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Dropping ICE candidate");
                }
            }
            MessageType::Answer => {
                let peer_id = PeerId::from(envelope.peer_id.as_str());
                if let Err(e) = self.sfu.apply_remote_answer(room_id, &peer_id, &envelope.data).await {
                    warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Dropping answer");
                }
            }
            MessageType::Offer => debug!(room_id = %room_id, "Ignoring client offer"),
            MessageType::DeleteChannel => {
                let peer_id = PeerId::from(envelope.peer_id.as_str());
                match self.sfu.delete_channel(room_id, &peer_id).await {
                    Ok(()) => session
                        .peers
                        .retain(|(room, peer)| !(*room == room_id && *peer == peer_id)),
                    Err(e) => warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Delete channel failed"),
                }
            }
        }

        if !envelope.message_type.is_broadcast() {
            return None;
        }
        envelope.user = session.display_name(&envelope.user);
        Some(Outbound::to_room(envelope, session.last_connection_id.clone()))
    }

    /// Leaving deletes the whole room; everyone who was in it hears about it.
    async fn leave(&self, session: &mut Session, mut envelope: Envelope) -> Option<Outbound> {
        let room_id = envelope.room_id;
        let connection_id = session.last_connection_id.clone();
        session.forget_room(room_id);

        let closed_peers = self.sfu.delete_room(room_id).await;
        let Some(room) = self.registry().delete(room_id) else {
            debug!(room_id = %room_id, closed_peers, "Leave for a room that does not exist");
            return None;
        };

        envelope.user = session.display_name(&envelope.user);
        Some(Outbound {
            envelope,
            connection_id,
            audience: Audience::Members(room.members.into_iter().collect()),
        })
    }

    async fn video_call(&self, session: &mut Session, room_id: RoomId) {
        if !self.registry().contains(room_id) {
            debug!(room_id = %room_id, "Video call for unknown room");
            reply_missing_room(session, room_id).await;
            return;
        }

        let peer_id = match self.sfu.admit_peer(room_id, &session.connection).await {
            Ok(peer_id) => peer_id,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Failed to admit media peer");
                return;
            }
        };

        // the room can be deleted by another socket while the peer is set up
        if !self.registry().contains(room_id) {
            debug!(room_id = %room_id, peer_id = %peer_id, "Room went away during admission");
            if let Err(e) = self.sfu.delete_channel(room_id, &peer_id).await {
                debug!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to drop orphaned peer");
            }
            reply_missing_room(session, room_id).await;
            return;
        }
        session.peers.push((room_id, peer_id));
    }

    async fn release(&self, session: &Session) {
        for (room_id, connection_id) in &session.memberships {
            self.registry().remove_member(*room_id, connection_id);
        }

        for (room_id, peer_id) in &session.peers {
            match self.sfu.delete_channel(*room_id, peer_id).await {
                Ok(()) | Err(SfuError::PeerNotFound { .. } | SfuError::RoomNotFound(_)) => {}
                Err(e) => debug!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to release peer"),
            }
        }

        debug!(
            connection = %session.connection.id(),
            memberships = session.memberships.len(),
            peers = session.peers.len(),
            "Released session state"
        );
    }
}

async fn reply_missing_room(session: &Session, room_id: RoomId) {
    if let Err(e) = session
        .connection
        .send_error(format!("room {room_id} does not exist"))
        .await
    {
        debug!(room_id = %room_id, error = %e, "Failed to send error reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_session_keeps_claimed_name() {
        let (connection, _) = duggu_core::test_helpers::memory_connection();
        let session = Session::new(connection, Identity::anonymous());
        assert_eq!(session.display_name("alice"), "alice");
        assert_eq!(session.display_name(""), "anonymous");
    }

    #[test]
    fn test_anonymous_session_remembers_join_name() {
        let (connection, _) = duggu_core::test_helpers::memory_connection();
        let mut session = Session::new(connection, Identity::anonymous());
        session.joined_as = Some("alice".to_string());
        assert_eq!(session.display_name(""), "alice");
        assert_eq!(session.display_name("bob"), "bob");
    }

    #[test]
    fn test_verified_name_wins_over_claim() {
        let (connection, _) = duggu_core::test_helpers::memory_connection();
        let session = Session::new(
            connection,
            Identity {
                user_id: Some(3),
                display_name: "carol".to_string(),
            },
        );
        assert_eq!(session.display_name("mallory"), "carol");
    }

    #[test]
    fn test_forget_room_drops_only_that_room() {
        let (connection, _) = duggu_core::test_helpers::memory_connection();
        let mut session = Session::new(connection, Identity::anonymous());
        session.memberships = vec![
            (RoomId::new(1), ConnectionId::from("a")),
            (RoomId::new(2), ConnectionId::from("b")),
        ];
        session.peers = vec![(RoomId::new(1), PeerId::from("p"))];
        session.last_connection_id = Some(ConnectionId::from("b"));

        session.forget_room(RoomId::new(1));

        assert_eq!(session.memberships, vec![(RoomId::new(2), ConnectionId::from("b"))]);
        assert!(session.peers.is_empty());
        assert!(session.last_connection_id.is_some());
    }
}
