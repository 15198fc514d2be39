//! Per-room SFU state

use std::collections::HashMap;
use std::sync::Arc;

use duggu_core::models::{PeerId, RoomId};
use duggu_core::WeakConnection;

use crate::engine::{LocalTrack, MediaPeer};
use crate::types::TrackId;

/// One participant's media session
pub struct RtcPeer {
    pub id: PeerId,
    pub handle: Arc<dyn MediaPeer>,
    /// Where offers go; does not keep the socket alive
    pub connection: WeakConnection,
    /// Sender set changed (or never offered) since the last delivered offer
    pub needs_offer: bool,
}

impl RtcPeer {
    pub fn new(id: PeerId, handle: Arc<dyn MediaPeer>, connection: WeakConnection) -> Self {
        Self {
            id,
            handle,
            connection,
            needs_offer: true,
        }
    }
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("needs_offer", &self.needs_offer)
            .finish_non_exhaustive()
    }
}

/// Peers and forwarded tracks of one room, always accessed under the room lock
pub struct RtcChannel {
    pub room_id: RoomId,
    pub peers: HashMap<PeerId, RtcPeer>,
    pub forwarded_tracks: HashMap<TrackId, Arc<dyn LocalTrack>>,
    /// Set once the channel has been dropped from the manager
    pub(crate) retired: bool,
}

impl RtcChannel {
    #[must_use]
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            peers: HashMap::new(),
            forwarded_tracks: HashMap::new(),
            retired: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.forwarded_tracks.is_empty()
    }
}
