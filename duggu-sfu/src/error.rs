use thiserror::Error;

use duggu_core::models::{PeerId, RoomId};

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Peer {peer_id} not found in room {room_id}")]
    PeerNotFound { room_id: RoomId, peer_id: PeerId },

    #[error("Room {0} has no video call")]
    RoomNotFound(RoomId),

    #[error("Signaling error: {0}")]
    Signal(String),
}

impl From<webrtc::Error> for SfuError {
    fn from(e: webrtc::Error) -> Self {
        Self::Engine(e.to_string())
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<duggu_core::Error> for SfuError {
    fn from(e: duggu_core::Error) -> Self {
        Self::Signal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
