//! SFU Manager - per-room peer/track state and renegotiation
//!
//! Each room's [`RtcChannel`] sits behind its own async mutex in a `DashMap`,
//! so renegotiation in one room never waits on another.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use duggu_core::models::{Envelope, MessageType, PeerId, RoomId};
use duggu_core::{Connection, WeakConnection};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::channel::{RtcChannel, RtcPeer};
use crate::config::SfuConfig;
use crate::engine::{LocalTrack, MediaEngine, MediaPeer};
use crate::error::{Result, SfuError};
use crate::track::forward_track;
use crate::types::{IceCandidateInit, PeerConnectionState, SessionDescription, TrackId};

/// Result of one synchronization attempt, or of a whole pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every peer sends exactly the room's forwarded tracks and holds a current offer
    Converged,
    /// Something failed; run again
    Retry,
}

pub struct SfuManager {
    engine: Arc<dyn MediaEngine>,
    config: SfuConfig,
    channels: DashMap<RoomId, Arc<Mutex<RtcChannel>>>,
    weak_self: Weak<Self>,
}

impl SfuManager {
    pub fn new(engine: Arc<dyn MediaEngine>, config: SfuConfig) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak_self| Self {
            engine,
            config,
            channels: DashMap::new(),
            weak_self: weak_self.clone(),
        });

        info!(
            max_sync_attempts = manager.config.max_sync_attempts,
            resync_backoff_ms = manager.config.resync_backoff.as_millis() as u64,
            ice_servers = manager.config.ice_servers.len(),
            "SFU Manager initialized"
        );

        manager
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    fn channel(&self, room_id: RoomId) -> Option<Arc<Mutex<RtcChannel>>> {
        self.channels.get(&room_id).map(|c| Arc::clone(c.value()))
    }

    /// Lock the room's channel, creating it if needed.
    async fn open_channel(&self, room_id: RoomId) -> OwnedMutexGuard<RtcChannel> {
        loop {
            let channel = Arc::clone(
                self.channels
                    .entry(room_id)
                    .or_insert_with(|| Arc::new(Mutex::new(RtcChannel::new(room_id))))
                    .value(),
            );
            let guard = channel.lock_owned().await;
            // lost a race with retirement, the map now holds a fresh channel
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Create a media peer for `connection` in `room_id` and start negotiating.
    pub async fn admit_peer(&self, room_id: RoomId, connection: &Connection) -> Result<PeerId> {
        let handle = self.engine.create_peer().await?;
        if let Err(e) = handle.add_recv_transceivers().await {
            if let Err(close_err) = handle.close().await {
                debug!(room_id = %room_id, error = %close_err, "Failed to close rejected peer");
            }
            return Err(e);
        }

        let peer_id = PeerId::new();
        let weak_connection = connection.downgrade();
        self.wire_peer(room_id, &peer_id, &handle, weak_connection.clone());

        {
            let mut channel = self.open_channel(room_id).await;
            channel.peers.insert(
                peer_id.clone(),
                RtcPeer::new(peer_id.clone(), handle, weak_connection),
            );
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                connection_id = %connection.id(),
                peers = channel.peers.len(),
                "Peer admitted"
            );
        }

        self.signal_peer_connections(room_id).await;
        Ok(peer_id)
    }

    fn wire_peer(
        &self,
        room_id: RoomId,
        peer_id: &PeerId,
        handle: &Arc<dyn MediaPeer>,
        connection: WeakConnection,
    ) {
        let candidate_peer_id = peer_id.clone();
        handle.on_ice_candidate(Box::new(move |candidate| {
            let connection = connection.clone();
            let peer_id = candidate_peer_id.clone();
            Box::pin(async move {
                send_candidate(room_id, &peer_id, &connection, &candidate).await;
            })
        }));

        let weak_peer = Arc::downgrade(handle);
        let manager = self.weak_self.clone();
        let state_peer_id = peer_id.clone();
        handle.on_connection_state_change(Box::new(move |state| {
            let weak_peer = weak_peer.clone();
            let manager = manager.clone();
            let peer_id = state_peer_id.clone();
            Box::pin(async move {
                debug!(room_id = %room_id, peer_id = %peer_id, state = ?state, "Peer connection state changed");
                match state {
                    PeerConnectionState::Failed => {
                        if let Some(peer) = weak_peer.upgrade() {
                            tokio::spawn(async move {
                                if let Err(e) = peer.close().await {
                                    warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to close failed peer");
                                }
                            });
                        }
                    }
                    PeerConnectionState::Closed => {
                        if let Some(manager) = manager.upgrade() {
                            tokio::spawn(async move {
                                manager.signal_peer_connections(room_id).await;
                            });
                        }
                    }
                    _ => {}
                }
            })
        }));

        let manager = self.weak_self.clone();
        let track_peer_id = peer_id.clone();
        handle.on_track(Box::new(move |remote| {
            let manager = manager.clone();
            let peer_id = track_peer_id.clone();
            Box::pin(async move {
                if let Some(manager) = manager.upgrade() {
                    tokio::spawn(forward_track(manager, room_id, peer_id, remote));
                }
            })
        }));
    }

    /// Bring every peer in the room in line with the forwarded track set.
    ///
    /// Runs up to `max_sync_attempts` attempts under the room lock. If none
    /// converges the lock is released and a fresh pass is scheduled after
    /// `resync_backoff`. A converged pass ends with a keyframe request to
    /// every publisher.
    pub async fn signal_peer_connections(&self, room_id: RoomId) -> SyncOutcome {
        let Some(channel) = self.channel(room_id) else {
            return SyncOutcome::Converged;
        };

        let outcome = {
            let mut guard = channel.lock().await;
            if guard.retired {
                return SyncOutcome::Converged;
            }

            let mut outcome = SyncOutcome::Retry;
            for attempt in 1..=self.config.max_sync_attempts {
                outcome = attempt_sync(&mut guard).await;
                if outcome == SyncOutcome::Converged {
                    debug!(room_id = %room_id, attempt, peers = guard.peers.len(), "Room converged");
                    break;
                }
            }

            if guard.is_empty() {
                guard.retired = true;
                self.channels
                    .remove_if(&room_id, |_, current| Arc::ptr_eq(current, &channel));
                debug!(room_id = %room_id, "Channel empty, removed");
            }

            outcome
        };

        match outcome {
            SyncOutcome::Converged => self.dispatch_keyframes(room_id).await,
            SyncOutcome::Retry => {
                warn!(
                    room_id = %room_id,
                    attempts = self.config.max_sync_attempts,
                    "Room did not converge, deferring"
                );
                self.schedule_resync(room_id);
            }
        }

        outcome
    }

    fn schedule_resync(&self, room_id: RoomId) {
        let manager = self.weak_self.clone();
        let backoff = self.config.resync_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(manager) = manager.upgrade() {
                manager.signal_peer_connections(room_id).await;
            }
        });
    }

    /// Ask every publisher in the room for a keyframe.
    pub async fn dispatch_keyframes(&self, room_id: RoomId) {
        let Some(channel) = self.channel(room_id) else {
            return;
        };
        let peers: Vec<_> = channel
            .lock()
            .await
            .peers
            .values()
            .map(|peer| (peer.id.clone(), Arc::clone(&peer.handle)))
            .collect();

        for (peer_id, handle) in peers {
            if let Err(e) = handle.request_keyframes().await {
                debug!(room_id = %room_id, peer_id = %peer_id, error = %e, "Keyframe request failed");
            }
        }
    }

    async fn peer_handle(&self, room_id: RoomId, peer_id: &PeerId) -> Result<Arc<dyn MediaPeer>> {
        let channel = self
            .channel(room_id)
            .ok_or(SfuError::RoomNotFound(room_id))?;
        let guard = channel.lock().await;
        guard
            .peers
            .get(peer_id)
            .map(|peer| Arc::clone(&peer.handle))
            .ok_or_else(|| SfuError::PeerNotFound {
                room_id,
                peer_id: peer_id.clone(),
            })
    }

    /// Apply a trickled ICE candidate from the client.
    pub async fn apply_ice_candidate(&self, room_id: RoomId, peer_id: &PeerId, data: &str) -> Result<()> {
        let candidate: IceCandidateInit = serde_json::from_str(data)
            .map_err(|e| SfuError::Decode(format!("ice candidate: {e}")))?;
        let handle = self.peer_handle(room_id, peer_id).await?;
        handle.add_ice_candidate(candidate).await
    }

    /// Apply the client's answer to our last offer.
    pub async fn apply_remote_answer(&self, room_id: RoomId, peer_id: &PeerId, data: &str) -> Result<()> {
        let answer: SessionDescription = serde_json::from_str(data)
            .map_err(|e| SfuError::Decode(format!("session description: {e}")))?;
        let handle = self.peer_handle(room_id, peer_id).await?;
        handle.set_remote_description(answer).await?;
        debug!(room_id = %room_id, peer_id = %peer_id, "Remote answer applied");
        Ok(())
    }

    /// Tear down one peer and renegotiate the rest of the room.
    pub async fn delete_channel(&self, room_id: RoomId, peer_id: &PeerId) -> Result<()> {
        let channel = self
            .channel(room_id)
            .ok_or(SfuError::RoomNotFound(room_id))?;
        let removed = channel.lock().await.peers.remove(peer_id);
        let Some(peer) = removed else {
            return Err(SfuError::PeerNotFound {
                room_id,
                peer_id: peer_id.clone(),
            });
        };

        if let Err(e) = peer.handle.close().await {
            warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to close peer");
        }
        info!(room_id = %room_id, peer_id = %peer_id, "Peer removed");

        self.signal_peer_connections(room_id).await;
        Ok(())
    }

    /// Drop all SFU state of a room, closing every peer. Returns how many
    /// peers were closed.
    pub async fn delete_room(&self, room_id: RoomId) -> usize {
        let Some((_, channel)) = self.channels.remove(&room_id) else {
            return 0;
        };

        let peers: Vec<RtcPeer> = {
            let mut guard = channel.lock().await;
            guard.retired = true;
            guard.forwarded_tracks.clear();
            guard.peers.drain().map(|(_, peer)| peer).collect()
        };

        for peer in &peers {
            if let Err(e) = peer.handle.close().await {
                debug!(room_id = %room_id, peer_id = %peer.id, error = %e, "Failed to close peer");
            }
        }

        info!(room_id = %room_id, peers = peers.len(), "Video room deleted");
        peers.len()
    }

    pub(crate) async fn register_track(&self, room_id: RoomId, track: Arc<dyn LocalTrack>) -> bool {
        let Some(channel) = self.channel(room_id) else {
            return false;
        };
        let mut guard = channel.lock().await;
        if guard.retired {
            return false;
        }
        guard.forwarded_tracks.insert(track.id(), track);
        true
    }

    pub(crate) async fn deregister_track(&self, room_id: RoomId, track_id: &TrackId) {
        if let Some(channel) = self.channel(room_id) {
            channel.lock().await.forwarded_tracks.remove(track_id);
        }
    }

    pub async fn peer_ids(&self, room_id: RoomId) -> Vec<PeerId> {
        match self.channel(room_id) {
            Some(channel) => channel.lock().await.peers.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn forwarded_track_ids(&self, room_id: RoomId) -> Vec<TrackId> {
        match self.channel(room_id) {
            Some(channel) => channel.lock().await.forwarded_tracks.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.channels.len()
    }
}

/// One pass over every peer of the room.
async fn attempt_sync(channel: &mut RtcChannel) -> SyncOutcome {
    let room_id = channel.room_id;

    channel.peers.retain(|peer_id, peer| {
        let closed = peer.handle.connection_state() == PeerConnectionState::Closed;
        if closed {
            info!(room_id = %room_id, peer_id = %peer_id, "Pruned closed peer");
        }
        !closed
    });

    let RtcChannel {
        peers,
        forwarded_tracks,
        ..
    } = channel;

    for peer in peers.values_mut() {
        let sending = peer.handle.sending_track_ids().await;

        for track_id in sending.iter().filter(|id| !forwarded_tracks.contains_key(*id)) {
            if let Err(e) = peer.handle.remove_track(track_id).await {
                debug!(room_id = %room_id, peer_id = %peer.id, track_id = %track_id, error = %e, "Remove track failed");
                return SyncOutcome::Retry;
            }
            peer.needs_offer = true;
        }

        // never hand a peer back its own published track
        let receiving = peer.handle.receiving_track_ids().await;

        for (track_id, track) in forwarded_tracks.iter() {
            if sending.contains(track_id) || receiving.contains(track_id) {
                continue;
            }
            if let Err(e) = peer.handle.add_track(Arc::clone(track)).await {
                debug!(room_id = %room_id, peer_id = %peer.id, track_id = %track_id, error = %e, "Add track failed");
                return SyncOutcome::Retry;
            }
            peer.needs_offer = true;
        }

        if !peer.needs_offer {
            continue;
        }

        if let Err(e) = send_offer(room_id, peer).await {
            debug!(room_id = %room_id, peer_id = %peer.id, error = %e, "Offer not delivered");
            return SyncOutcome::Retry;
        }
        peer.needs_offer = false;
    }

    SyncOutcome::Converged
}

async fn send_offer(room_id: RoomId, peer: &RtcPeer) -> Result<()> {
    let Some(connection) = peer.connection.upgrade().filter(|c| !c.is_closed()) else {
        // nobody left to negotiate with; closing lets the next attempt prune it
        close_quietly(room_id, peer).await;
        return Err(SfuError::Signal("connection gone".to_string()));
    };

    let offer = peer.handle.create_offer().await?;
    peer.handle.set_local_description(offer.clone()).await?;

    let envelope = Envelope::new(MessageType::Offer, room_id)
        .with_peer_id(peer.id.as_str())
        .with_data(serde_json::to_string(&offer)?);

    if let Err(e) = connection.write_json(&envelope).await {
        close_quietly(room_id, peer).await;
        return Err(e.into());
    }

    debug!(room_id = %room_id, peer_id = %peer.id, "Offer sent");
    Ok(())
}

async fn close_quietly(room_id: RoomId, peer: &RtcPeer) {
    if let Err(e) = peer.handle.close().await {
        debug!(room_id = %room_id, peer_id = %peer.id, error = %e, "Failed to close peer");
    }
}

async fn send_candidate(
    room_id: RoomId,
    peer_id: &PeerId,
    connection: &WeakConnection,
    candidate: &IceCandidateInit,
) {
    let Some(connection) = connection.upgrade() else {
        return;
    };

    let data = match serde_json::to_string(candidate) {
        Ok(data) => data,
        Err(e) => {
            warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to encode ICE candidate");
            return;
        }
    };

    let envelope = Envelope::new(MessageType::Candidate, room_id)
        .with_peer_id(peer_id.as_str())
        .with_data(data);
    if let Err(e) = connection.write_json(&envelope).await {
        debug!(room_id = %room_id, peer_id = %peer_id, error = %e, "Failed to send ICE candidate");
    }
}
