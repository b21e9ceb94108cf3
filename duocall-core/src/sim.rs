//! Simulated media and connection runtime
//!
//! Runs the whole negotiation in-process without devices or sockets.
//! [`SimMediaDevices`] issues fake tracks under a configurable permission
//! policy. [`SimPeerConnection`]s created from one [`SimNetwork`] find each
//! other through a session token embedded in their SDP, trickle fake host
//! candidates, and report `Connected` once both descriptions are applied and
//! a remote candidate has arrived. On connect each side receives mirrors of
//! the other side's outgoing tracks.

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
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

const SESSION_ATTRIBUTE: &str = "a=sim-session:";
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

/// Fake capture or inbound track
#[derive(Debug)]
pub struct SimTrack {
    id: String,
    kind: TrackKind,
    facing: Option<FacingMode>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl SimTrack {
    /// New live track
    pub fn new(kind: TrackKind, facing: Option<FacingMode>) -> Arc<Self> {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, facing)
    }

    fn with_id(id: String, kind: TrackKind, facing: Option<FacingMode>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            facing,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }

    /// Camera facing, for video tracks
    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }
}

impl MediaTrack for SimTrack {
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

#[derive(Default)]
struct DevicesState {
    deny_camera: bool,
    deny_microphone: bool,
    camera_unavailable: bool,
    issued: Vec<Arc<SimTrack>>,
    requests: Vec<CaptureRequest>,
}

/// Fake capture devices with a scriptable permission policy
#[derive(Clone)]
pub struct SimMediaDevices {
    state: Arc<Mutex<DevicesState>>,
    hold: Arc<watch::Sender<bool>>,
}

impl Default for SimMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMediaDevices {
    /// Devices that grant every request
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(DevicesState::default())),
            hold: Arc::new(hold),
        }
    }

    /// Refuse camera access
    pub fn deny_camera(&self, deny: bool) {
        self.state.lock().deny_camera = deny;
    }

    /// Refuse microphone access
    pub fn deny_microphone(&self, deny: bool) {
        self.state.lock().deny_microphone = deny;
    }

    /// Report the camera as missing or busy
    pub fn set_camera_unavailable(&self, unavailable: bool) {
        self.state.lock().camera_unavailable = unavailable;
    }

    /// Keep requests pending, as if a permission prompt were showing
    pub fn hold_requests(&self, hold: bool) {
        self.hold.send_replace(hold);
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<Arc<SimTrack>> {
        self.state.lock().issued.clone()
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl MediaDevices for SimMediaDevices {
    async fn get_user_media(&self, request: CaptureRequest) -> Result<MediaStream, MediaError> {
        self.state.lock().requests.push(request);

        let mut gate = self.hold.subscribe();
        let _ = gate.wait_for(|held| !*held).await;

        let mut state = self.state.lock();
        if request.audio && state.deny_microphone {
            return Err(MediaError::PermissionDenied("microphone".to_string()));
        }
        if request.video.is_some() {
            if state.deny_camera {
                return Err(MediaError::PermissionDenied("camera".to_string()));
            }
            if state.camera_unavailable {
                return Err(MediaError::DeviceUnavailable("camera".to_string()));
            }
        }

        let mut tracks: Vec<TrackHandle> = Vec::new();
        if request.audio {
            let track = SimTrack::new(TrackKind::Audio, None);
            state.issued.push(track.clone());
            tracks.push(track);
        }
        if let Some(facing) = request.video {
            let track = SimTrack::new(TrackKind::Video, Some(facing));
            state.issued.push(track.clone());
            tracks.push(track);
        }
        Ok(MediaStream::new(tracks))
    }
}

struct NetworkInner {
    sessions: HashMap<String, Weak<SimPeerConnection>>,
    connections: Vec<Arc<SimPeerConnection>>,
    auto_connect: bool,
}

/// Shared medium for simulated peer connections
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    /// Network where connections connect on their own
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                sessions: HashMap::new(),
                connections: Vec::new(),
                auto_connect: true,
            })),
        }
    }

    /// Factory whose connections carry `label`
    pub fn factory(&self, label: impl Into<String>) -> SimPeerConnectionFactory {
        SimPeerConnectionFactory {
            network: self.clone(),
            label: label.into(),
        }
    }

    /// Disable automatic connection; states are then driven by
    /// [`SimPeerConnection::force_state`]
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.inner.lock().auto_connect = auto_connect;
    }

    /// Every connection created so far
    pub fn connections(&self) -> Vec<Arc<SimPeerConnection>> {
        self.inner.lock().connections.clone()
    }

    /// Connections created by the factory labelled `label`
    pub fn connections_for(&self, label: &str) -> Vec<Arc<SimPeerConnection>> {
        self.inner
            .lock()
            .connections
            .iter()
            .filter(|c| c.label == label)
            .cloned()
            .collect()
    }
}

/// Creates [`SimPeerConnection`]s on a [`SimNetwork`]
#[derive(Clone)]
pub struct SimPeerConnectionFactory {
    network: SimNetwork,
    label: String,
}

#[async_trait]
impl PeerConnectionFactory for SimPeerConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let session = uuid::Uuid::new_v4().simple().to_string();
        let connection = Arc::new(SimPeerConnection {
            label: self.label.clone(),
            session: session.clone(),
            network: Arc::downgrade(&self.network.inner),
            events,
            state: Mutex::new(ConnectionState::default()),
        });

        let mut network = self.network.inner.lock();
        network
            .sessions
            .insert(session.clone(), Arc::downgrade(&connection));
        network.connections.push(connection.clone());
        drop(network);

        tracing::debug!(
            label = %self.label,
            session = %session,
            ice_servers = ice_servers.len(),
            "Simulated peer connection created"
        );
        Ok(connection as Arc<dyn PeerConnection>)
    }
}

struct ConnectionState {
    senders: Vec<TrackHandle>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_session: Option<String>,
    applied: Vec<IceCandidate>,
    connection: PeerConnectionState,
    closed: bool,
    next_port: u16,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            local: None,
            remote: None,
            remote_session: None,
            applied: Vec::new(),
            connection: PeerConnectionState::New,
            closed: false,
            next_port: 50_000,
        }
    }
}

/// In-process peer connection
pub struct SimPeerConnection {
    label: String,
    session: String,
    network: Weak<Mutex<NetworkInner>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<ConnectionState>,
}

impl SimPeerConnection {
    /// Factory label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tracks currently sent, one per sender
    pub fn senders(&self) -> Vec<TrackHandle> {
        self.state.lock().senders.clone()
    }

    /// Remote candidates applied, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Whether [`PeerConnection::close`] has run
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether a remote description is applied
    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    /// Current connection state
    pub fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    /// Drive the connection into `state` and report it
    pub fn force_state(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        let _ = self.events.send(PeerEvent::ConnectionStateChanged(state));
    }

    fn describe(&self, state: &ConnectionState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\n{}{}\r\n",
            state.senders.len(),
            SESSION_ATTRIBUTE,
            self.session
        );
        for track in &state.senders {
            let media = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={media} 9 UDP/TLS/RTP/SAVPF 0\r\n"));
        }
        sdp
    }

    fn ensure_open(state: &ConnectionState) -> Result<(), PeerError> {
        if state.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn auto_connect_enabled(&self) -> bool {
        self.network
            .upgrade()
            .is_some_and(|network| network.lock().auto_connect)
    }

    fn counterpart(&self, session: &str) -> Option<Arc<SimPeerConnection>> {
        let network = self.network.upgrade()?;
        let network = network.lock();
        network.sessions.get(session).and_then(Weak::upgrade)
    }

    fn try_connect(&self) {
        if !self.auto_connect_enabled() {
            return;
        }
        let remote_session = {
            let mut state = self.state.lock();
            let ready = !state.closed
                && state.connection == PeerConnectionState::New
                && state.local.is_some()
                && state.remote.is_some()
                && !state.applied.is_empty();
            if !ready {
                return;
            }
            state.connection = PeerConnectionState::Connected;
            state.remote_session.clone()
        };

        let _ = self.events.send(PeerEvent::ConnectionStateChanged(
            PeerConnectionState::Connecting,
        ));
        let _ = self.events.send(PeerEvent::ConnectionStateChanged(
            PeerConnectionState::Connected,
        ));

        let remote_tracks = remote_session
            .and_then(|session| self.counterpart(&session))
            .map(|peer| peer.senders())
            .unwrap_or_default();
        for track in remote_tracks {
            let mirror: TrackHandle =
                SimTrack::with_id(track.id().to_string(), track.kind(), None);
            let _ = self.events.send(PeerEvent::Track(mirror));
        }
        tracing::debug!(label = %self.label, "Simulated peer connection connected");
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn add_track(&self, track: TrackHandle) -> Result<SenderId, PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.senders.push(track);
        Ok(SenderId(state.senders.len() - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: TrackHandle) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let slot = state
            .senders
            .get_mut(sender.0)
            .ok_or_else(|| PeerError::InvalidState(format!("unknown sender {}", sender.0)))?;
        if slot.kind() != track.kind() {
            return Err(PeerError::Unsupported("track kind change".to_string()));
        }
        *slot = track;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(SessionDescription::offer(self.describe(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(self.describe(&state)))
            }
            _ => Err(PeerError::InvalidState(
                "answer requires a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let candidates = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.local = Some(description);
            (0..CANDIDATES_PER_DESCRIPTION)
                .map(|i| {
                    let port = state.next_port;
                    state.next_port += 1;
                    IceCandidate {
                        candidate: format!(
                            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                            i + 1,
                            port
                        ),
                        sdp_mid: Some("0".to_string()),
                        sdp_mline_index: Some(0),
                        username_fragment: Some(self.session[..8].to_string()),
                    }
                })
                .collect::<Vec<_>>()
        };
        for candidate in candidates {
            let _ = self.events.send(PeerEvent::IceCandidate(candidate));
        }
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let session = description
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(SESSION_ATTRIBUTE))
            .map(|s| s.trim().to_string())
            .ok_or_else(|| PeerError::InvalidDescription("missing session".to_string()))?;
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.remote = Some(description);
            state.remote_session = Some(session);
        }
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(PeerError::InvalidState(
                    "remote description not set".to_string(),
                ));
            }
            state.applied.push(candidate);
        }
        self.try_connect();
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.connection = PeerConnectionState::Closed;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn pair(network: &SimNetwork) -> (
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerEvent>,
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let a = network.factory("a").create(&[], tx_a).await.unwrap();
        let b = network.factory("b").create(&[], tx_b).await.unwrap();
        (a, rx_a, b, rx_b)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidates(events: &[PeerEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                PeerEvent::IceCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_devices_policy() {
        let devices = SimMediaDevices::new();
        devices.set_camera_unavailable(true);
        let result = devices
            .get_user_media(CaptureRequest::audio_video(FacingMode::User))
            .await;
        assert!(matches!(result, Err(MediaError::DeviceUnavailable(_))));

        let stream = devices
            .get_user_media(CaptureRequest::audio_only())
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(devices.issued_tracks().len(), 1);
        assert_eq!(devices.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_an_error() {
        let network = SimNetwork::new();
        let (a, _rx_a, _, _) = pair(&network).await;
        let result = a.add_ice_candidate(IceCandidate::new("candidate:1")).await;
        assert!(matches!(result, Err(PeerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let network = SimNetwork::new();
        let (a, _rx_a, _, _) = pair(&network).await;
        assert!(matches!(
            a.create_answer().await,
            Err(PeerError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_pair_connects_and_exchanges_tracks() {
        let network = SimNetwork::new();
        let (a, mut rx_a, b, mut rx_b) = pair(&network).await;
        let audio = SimTrack::new(TrackKind::Audio, None);
        a.add_track(audio.clone()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_candidates = candidates(&drain(&mut rx_a));
        let b_candidates = candidates(&drain(&mut rx_b));
        assert_eq!(a_candidates.len(), 2);
        assert_eq!(b_candidates.len(), 2);

        b.add_ice_candidate(a_candidates[0].clone()).await.unwrap();
        let events = drain(&mut rx_b);
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected)
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::Track(t) if t.id() == audio.id())));

        a.add_ice_candidate(b_candidates[0].clone()).await.unwrap();
        let events = drain(&mut rx_a);
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected)
        )));
        assert!(!events.iter().any(|e| matches!(e, PeerEvent::Track(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let network = SimNetwork::new();
        let (a, mut rx_a, _, _) = pair(&network).await;
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(network.connections_for("a")[0].is_closed());
        assert!(matches!(a.create_offer().await, Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn test_force_state_reports_event() {
        let network = SimNetwork::new();
        network.set_auto_connect(false);
        let (_, mut rx_a, _, _) = pair(&network).await;
        let connection = network.connections_for("a").pop().unwrap();
        connection.force_state(PeerConnectionState::Failed);
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [PeerEvent::ConnectionStateChanged(PeerConnectionState::Failed)]
        ));
    }
}
