//! Seam between the SFU and the WebRTC stack
//!
//! [`SfuManager`](crate::SfuManager) only talks to these traits, so the
//! renegotiation logic can run against a scripted engine in tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;
use crate::types::{IceCandidateInit, PeerConnectionState, SessionDescription, TrackId, TrackKind};

pub type IceCandidateHandler = Box<dyn Fn(IceCandidateInit) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StateChangeHandler =
    Box<dyn Fn(PeerConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(Arc<dyn RemoteTrack>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Factory for peer connections and forwarding tracks
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_peer(&self) -> Result<Arc<dyn MediaPeer>>;

    /// A local track with the same codec, id and stream id as `remote`
    async fn create_local_track(&self, remote: &dyn RemoteTrack) -> Result<Arc<dyn LocalTrack>>;
}

/// One server-side peer connection
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Prepare to receive one video and one audio track.
    async fn add_recv_transceivers(&self) -> Result<()>;

    fn connection_state(&self) -> PeerConnectionState;

    /// Ids of the local tracks this peer currently sends
    async fn sending_track_ids(&self) -> Vec<TrackId>;

    /// Ids of the remote tracks this peer currently publishes to us
    async fn receiving_track_ids(&self) -> Vec<TrackId>;

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    async fn remove_track(&self, track_id: &TrackId) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    /// Send a picture loss indication for every track received from this peer.
    async fn request_keyframes(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn on_ice_candidate(&self, handler: IceCandidateHandler);

    fn on_connection_state_change(&self, handler: StateChangeHandler);

    fn on_track(&self, handler: TrackHandler);
}

/// Media arriving from a publishing client
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> TrackId;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn codec(&self) -> RTCRtpCodecCapability;

    /// Next packet; an error means the track has ended.
    async fn read_rtp(&self) -> Result<Packet>;
}

/// Server-side track that fans one remote track out to subscribers
#[async_trait]
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> TrackId;

    async fn write_rtp(&self, packet: &Packet) -> Result<()>;

    /// Engine-native handle, when the track belongs to the `webrtc` stack
    fn native(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}
