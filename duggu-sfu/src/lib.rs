//! Duggu SFU (Selective Forwarding Unit)
//!
//! Every participant of a video call publishes its audio and video to the
//! server once; the server forwards each published track to every other peer
//! in the same room.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: per-room peer and track state, renegotiation and
//!   keyframe requests
//! - **`MediaEngine` / `MediaPeer`**: the seam to the WebRTC stack
//! - **`WebRtcEngine`**: the production engine over the `webrtc` crate
//!
//! ## Renegotiation
//!
//! Whenever peers or tracks change, [`SfuManager::signal_peer_connections`]
//! brings each peer's sender set in line with the room's forwarded tracks and
//! sends a fresh offer to peers whose senders changed. A pass retries up to
//! `max_sync_attempts` times, then hands off to a deferred pass after
//! `resync_backoff`.

mod channel;
mod config;
mod engine;
mod error;
mod manager;
pub mod test_helpers;
mod track;
mod types;
mod webrtc_engine;

pub use channel::{RtcChannel, RtcPeer};
pub use config::SfuConfig;
pub use engine::{
    IceCandidateHandler, LocalTrack, MediaEngine, MediaPeer, RemoteTrack, StateChangeHandler,
    TrackHandler,
};
pub use error::{Result, SfuError};
pub use manager::{SfuManager, SyncOutcome};
pub use types::{IceCandidateInit, PeerConnectionState, SdpType, SessionDescription, TrackId, TrackKind};
pub use webrtc::rtp::packet::Packet as RtpPacket;
pub use webrtc_engine::WebRtcEngine;
