//! Scripted media engine for tests
//!
//! Peers record every call the SFU makes and let a test drive state changes,
//! incoming tracks and ICE candidates by hand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::engine::{
    IceCandidateHandler, LocalTrack, MediaEngine, MediaPeer, RemoteTrack, StateChangeHandler,
    TrackHandler,
};
use crate::error::{Result, SfuError};
use crate::types::{IceCandidateInit, PeerConnectionState, SessionDescription, TrackId, TrackKind};

#[derive(Default)]
pub struct FakeEngine {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    creation_gate: Mutex<Option<Arc<Semaphore>>>,
    creations_waiting: AtomicUsize,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Peers in creation order
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    /// The most recently created peer
    #[must_use]
    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    /// Park every later `create_peer` until the returned gate gets a permit,
    /// one permit per peer.
    pub fn hold_peer_creation(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.creation_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Calls currently parked by [`hold_peer_creation`](Self::hold_peer_creation)
    #[must_use]
    pub fn creations_waiting(&self) -> usize {
        self.creations_waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_peer(&self) -> Result<Arc<dyn MediaPeer>> {
        let gate = self.creation_gate.lock().clone();
        if let Some(gate) = gate {
            self.creations_waiting.fetch_add(1, Ordering::SeqCst);
            let permit = gate.acquire().await;
            self.creations_waiting.fetch_sub(1, Ordering::SeqCst);
            permit
                .map_err(|_| SfuError::Engine("peer creation gate closed".to_string()))?
                .forget();
        }

        let peer = Arc::new(FakePeer::new());
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }

    async fn create_local_track(&self, remote: &dyn RemoteTrack) -> Result<Arc<dyn LocalTrack>> {
        Ok(Arc::new(FakeLocalTrack {
            id: remote.id(),
            written: AtomicUsize::new(0),
        }))
    }
}

pub struct FakePeer {
    state: Mutex<PeerConnectionState>,
    sending: Mutex<Vec<TrackId>>,
    receiving: Mutex<Vec<TrackId>>,
    pending_add_failures: AtomicUsize,
    add_calls: AtomicUsize,
    add_failures: AtomicUsize,
    remove_calls: AtomicUsize,
    offers: AtomicUsize,
    keyframe_requests: AtomicUsize,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidateInit>>,
    ice_handler: Mutex<Option<IceCandidateHandler>>,
    state_handler: Mutex<Option<StateChangeHandler>>,
    track_handler: Mutex<Option<TrackHandler>>,
}

impl FakePeer {
    fn new() -> Self {
        Self {
            state: Mutex::new(PeerConnectionState::New),
            sending: Mutex::new(Vec::new()),
            receiving: Mutex::new(Vec::new()),
            pending_add_failures: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            add_failures: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            offers: AtomicUsize::new(0),
            keyframe_requests: AtomicUsize::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            ice_handler: Mutex::new(None),
            state_handler: Mutex::new(None),
            track_handler: Mutex::new(None),
        }
    }

    /// Make the next `count` `add_track` calls fail.
    pub fn fail_next_adds(&self, count: usize) {
        self.pending_add_failures.store(count, Ordering::SeqCst);
    }

    /// Change state and notify the registered handler.
    pub async fn set_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
        let notify = self.state_handler.lock().as_ref().map(|handler| handler(state));
        if let Some(notify) = notify {
            notify.await;
        }
    }

    /// Start publishing `track` as if the client had sent it.
    pub async fn publish(&self, track: Arc<FakeRemoteTrack>) {
        self.receiving.lock().push(track.id());
        let notify = self
            .track_handler
            .lock()
            .as_ref()
            .map(|handler| handler(track as Arc<dyn RemoteTrack>));
        if let Some(notify) = notify {
            notify.await;
        }
    }

    /// Stop publishing the track with `track_id`.
    pub fn unpublish(&self, track_id: &TrackId) {
        self.receiving.lock().retain(|id| id != track_id);
    }

    /// Gather a local ICE candidate.
    pub async fn emit_candidate(&self, candidate: IceCandidateInit) {
        let notify = self.ice_handler.lock().as_ref().map(|handler| handler(candidate));
        if let Some(notify) = notify {
            notify.await;
        }
    }

    #[must_use]
    pub fn sending(&self) -> Vec<TrackId> {
        self.sending.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn add_failures(&self) -> usize {
        self.add_failures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn keyframe_requests(&self) -> usize {
        self.keyframe_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidateInit> {
        self.candidates.lock().clone()
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn add_recv_transceivers(&self) -> Result<()> {
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    async fn sending_track_ids(&self) -> Vec<TrackId> {
        self.sending()
    }

    async fn receiving_track_ids(&self) -> Vec<TrackId> {
        self.receiving.lock().clone()
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_add_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.add_failures.fetch_add(1, Ordering::SeqCst);
            return Err(SfuError::Engine("renegotiation in progress".to_string()));
        }
        self.sending.lock().push(track.id());
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.sending.lock().retain(|id| id != track_id);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        let tracks = self
            .sending()
            .iter()
            .map(TrackId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Ok(SessionDescription::offer(format!("v=0 offer={n} tracks={tracks}")))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn request_keyframes(&self) -> Result<()> {
        self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.set_state(PeerConnectionState::Closed).await;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        *self.ice_handler.lock() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: StateChangeHandler) {
        *self.state_handler.lock() = Some(handler);
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(handler);
    }
}

/// Published track fed by a channel; dropping the sender ends it
pub struct FakeRemoteTrack {
    id: TrackId,
    kind: TrackKind,
    packets: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl FakeRemoteTrack {
    #[must_use]
    pub fn new(id: &str, kind: TrackKind) -> (Arc<Self>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(64);
        let track = Arc::new(Self {
            id: TrackId::new(id),
            kind,
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        format!("stream-{}", self.id)
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability::default()
    }

    async fn read_rtp(&self) -> Result<Packet> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SfuError::Engine("track ended".to_string()))
    }
}

pub struct FakeLocalTrack {
    id: TrackId,
    written: AtomicUsize,
}

impl FakeLocalTrack {
    #[must_use]
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalTrack for FakeLocalTrack {
    fn id(&self) -> TrackId {
        self.id.clone()
    }

    async fn write_rtp(&self, _packet: &Packet) -> Result<()> {
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
