//! Media engine backed by the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::SfuConfig;
use crate::engine::{
    IceCandidateHandler, LocalTrack, MediaEngine, MediaPeer, RemoteTrack, StateChangeHandler,
    TrackHandler,
};
use crate::error::{Result, SfuError};
use crate::types::{
    IceCandidateInit, PeerConnectionState, SdpType, SessionDescription, TrackId, TrackKind,
};

/// Production engine: default codecs and interceptors, configured ICE servers
pub struct WebRtcEngine {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcEngine {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_peer(&self) -> Result<Arc<dyn MediaPeer>> {
        let pc = self.api.new_peer_connection(self.rtc_config.clone()).await?;
        Ok(Arc::new(WebRtcPeer { pc: Arc::new(pc) }))
    }

    async fn create_local_track(&self, remote: &dyn RemoteTrack) -> Result<Arc<dyn LocalTrack>> {
        let track = TrackLocalStaticRTP::new(
            remote.codec(),
            remote.id().to_string(),
            remote.stream_id(),
        );
        Ok(Arc::new(WebRtcLocalTrack {
            inner: Arc::new(track),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaPeer for WebRtcPeer {
    async fn add_recv_transceivers(&self) -> Result<()> {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await?;
        }
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.pc.connection_state().into()
    }

    async fn sending_track_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(TrackId::new(track.id()));
            }
        }
        ids
    }

    async fn receiving_track_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                let id = track.id();
                // receivers hold placeholder tracks until media arrives
                if !id.is_empty() {
                    ids.push(TrackId::new(id));
                }
            }
        }
        ids
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let native = track
            .native()
            .ok_or_else(|| SfuError::Engine(format!("track {} is not a webrtc track", track.id())))?;
        let sender = self.pc.add_track(native).await?;

        // RTCP has to be read for the interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &TrackId) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id.as_str() {
                self.pc.remove_track(&sender).await?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn request_keyframes(&self) -> Result<()> {
        let mut ssrcs = Vec::new();
        for receiver in self.pc.get_receivers().await {
            ssrcs.extend(receiver.tracks().await.iter().map(|track| track.ssrc()));
        }

        for request in picture_loss_requests(ssrcs) {
            let media_ssrc = request.media_ssrc;
            if let Err(e) = self.pc.write_rtcp(&[Box::new(request)]).await {
                warn!(media_ssrc, error = %e, "Failed to send keyframe request");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => handler(IceCandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Some(Err(e)) => {
                        warn!(error = %e, "Failed to serialize local ICE candidate");
                        Box::pin(async {})
                    }
                    // gathering complete
                    None => Box::pin(async {}),
                }
            }));
    }

    fn on_connection_state_change(&self, handler: StateChangeHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(state.into())
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                debug!(track_id = %track.id(), ssrc = track.ssrc(), "Remote track arrived");
                handler(Arc::new(WebRtcRemoteTrack { inner: track }))
            }));
    }
}

struct WebRtcRemoteTrack {
    inner: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> TrackId {
        TrackId::new(self.inner.id())
    }

    fn stream_id(&self) -> String {
        self.inner.stream_id()
    }

    fn kind(&self) -> TrackKind {
        match self.inner.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.inner.codec().capability
    }

    async fn read_rtp(&self) -> Result<Packet> {
        let (packet, _) = self.inner.read_rtp().await?;
        Ok(packet)
    }
}

struct WebRtcLocalTrack {
    inner: Arc<TrackLocalStaticRTP>,
}

#[async_trait]
impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> TrackId {
        TrackId::new(self.inner.id())
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<()> {
        self.inner.write_rtp(packet).await?;
        Ok(())
    }

    fn native(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(Arc::clone(&self.inner) as Arc<dyn TrackLocal + Send + Sync>)
    }
}

impl From<RTCPeerConnectionState> for PeerConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// One PLI per receiving SSRC; zero means no media has been bound yet.
fn picture_loss_requests(ssrcs: impl IntoIterator<Item = u32>) -> Vec<PictureLossIndication> {
    ssrcs
        .into_iter()
        .filter(|ssrc| *ssrc != 0)
        .map(|media_ssrc| PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })
        .collect()
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(SfuError::Decode("rollback descriptions are not supported".to_string()))
        }
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(SfuError::Engine("engine produced an untyped description".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}
