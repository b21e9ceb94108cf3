//! webrtc-rs backend for the media runtime contract
//!
//! [`RtcPeerConnectionFactory`] builds real peer connections with the default
//! codecs and interceptors. Outgoing media is carried by [`SampleTrack`]s,
//! which the application feeds with encoded frames; [`SampleMediaDevices`]
//! hands those tracks out in place of platform capture.

use crate::media::MediaError;
use crate::runtime::{
    CaptureRequest, MediaDevices, MediaStream, MediaTrack, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, SenderId, TrackHandle,
    TrackKind, TrackState,
};
use crate::types::{FacingMode, IceCandidate, IceServer, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn runtime_error(e: webrtc::Error) -> PeerError {
    PeerError::Runtime(e.to_string())
}

fn audio_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "".to_string(),
        rtcp_feedback: vec![],
    }
}

fn video_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Outgoing track fed with encoded samples
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    facing: Option<FacingMode>,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl SampleTrack {
    /// New opus audio track
    pub fn audio(stream_id: &str) -> Arc<Self> {
        Self::build(TrackKind::Audio, None, audio_codec(), stream_id)
    }

    /// New VP8 video track for the given camera
    pub fn video(stream_id: &str, facing: FacingMode) -> Arc<Self> {
        Self::build(TrackKind::Video, Some(facing), video_codec(), stream_id)
    }

    fn build(
        kind: TrackKind,
        facing: Option<FacingMode>,
        codec: RTCRtpCodecCapability,
        stream_id: &str,
    ) -> Arc<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(codec = %codec.mime_type, clock_rate = codec.clock_rate, "Sample track created");
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        Arc::new(Self {
            id,
            kind,
            facing,
            track,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }

    /// Camera facing, for video tracks
    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    /// Track handed to the peer connection
    pub fn local(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Send one encoded frame
    ///
    /// Frames are dropped while the track is disabled or stopped.
    ///
    /// # Errors
    ///
    /// Returns error if the frame could not be written
    pub async fn write_sample(&self, data: &[u8], duration: Duration) -> Result<(), PeerError> {
        if !self.is_enabled() || self.ready_state() == TrackState::Ended {
            return Ok(());
        }
        let sample = Sample {
            data: data.to_vec().into(),
            duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await.map_err(runtime_error)
    }
}

impl std::fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("facing", &self.facing)
            .finish()
    }
}

impl MediaTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inbound track from the remote peer
pub struct RemoteRtcTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl RemoteRtcTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            id: track.id(),
            kind,
            track,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    /// Underlying webrtc track, for reading RTP
    pub fn remote(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl std::fmt::Debug for RemoteRtcTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRtcTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RemoteRtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Devices backed by [`SampleTrack`]s
///
/// Every request is granted; the application is responsible for feeding
/// the returned tracks.
#[derive(Debug, Default)]
pub struct SampleMediaDevices;

impl SampleMediaDevices {
    /// Create devices
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for SampleMediaDevices {
    async fn get_user_media(&self, request: CaptureRequest) -> Result<MediaStream, MediaError> {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks: Vec<TrackHandle> = Vec::new();
        if request.audio {
            tracks.push(SampleTrack::audio(&stream_id));
        }
        if let Some(facing) = request.video {
            tracks.push(SampleTrack::video(&stream_id, facing));
        }
        let mut stream = MediaStream::new(tracks);
        stream.id = stream_id;
        Ok(stream)
    }
}

fn to_rtc_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

fn to_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

/// Factory for webrtc-rs peer connections
#[derive(Debug, Default)]
pub struct RtcPeerConnectionFactory;

impl RtcPeerConnectionFactory {
    /// Create factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(runtime_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(runtime_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create peer connection");
            runtime_error(e)
        })?);

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Cannot serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_events.send(PeerEvent::ConnectionStateChanged(to_state(state)));
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let track: TrackHandle = Arc::new(RemoteRtcTrack::new(track));
                let _ = track_events.send(PeerEvent::Track(track));
                Box::pin(async {})
            },
        ));

        tracing::debug!("Created peer connection");
        Ok(Arc::new(RtcPeerConnection {
            pc,
            senders: Mutex::new(Vec::new()),
        }) as Arc<dyn PeerConnection>)
    }
}

/// webrtc-rs peer connection
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

fn local_track(track: &TrackHandle) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
    let sample = track
        .as_any()
        .downcast_ref::<SampleTrack>()
        .ok_or_else(|| PeerError::Unsupported(format!("track {} is not a sample track", track.id())))?;
    Ok(sample.local())
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: TrackHandle) -> Result<SenderId, PeerError> {
        let local = local_track(&track)?;
        let sender = self.pc.add_track(local).await.map_err(runtime_error)?;
        let mut senders = self.senders.lock();
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: TrackHandle) -> Result<(), PeerError> {
        let local = local_track(&track)?;
        let rtp_sender = self
            .senders
            .lock()
            .get(sender.0)
            .cloned()
            .ok_or_else(|| PeerError::InvalidState(format!("unknown sender {}", sender.0)))?;
        rtp_sender
            .replace_track(Some(local))
            .await
            .map_err(runtime_error)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(runtime_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(runtime_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(runtime_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(runtime_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(runtime_error)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(runtime_error)
    }
}
