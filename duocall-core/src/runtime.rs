//! Media and connection runtime contract
//!
//! The negotiation layer never talks to a WebRTC stack directly. It consumes
//! capture devices through [`MediaDevices`] and peer connections through
//! [`PeerConnectionFactory`]/[`PeerConnection`], which lets the same state
//! machine run over webrtc-rs or over the in-process simulation.

use crate::media::MediaError;
use crate::types::{FacingMode, IceCandidate, IceServer, SessionDescription};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Underlying runtime failure
    #[error("Peer connection runtime error: {0}")]
    Runtime(String),

    /// Description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Operation not valid in the current signaling state
    #[error("Invalid peer connection state: {0}")]
    InvalidState(String),

    /// Track type not supported by this backend
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
}

/// Track lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Producing media
    Live,
    /// Stopped; never restarts
    Ended,
}

/// A local or remote media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Track kind
    fn kind(&self) -> TrackKind;

    /// Whether media flows
    fn is_enabled(&self) -> bool;

    /// Enable or disable media without stopping the track
    fn set_enabled(&self, enabled: bool);

    /// Lifecycle state
    fn ready_state(&self) -> TrackState;

    /// Stop the track, releasing the capture device
    fn stop(&self);

    /// Downcast support for backends that need their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a track
pub type TrackHandle = Arc<dyn MediaTrack>;

/// Group of tracks presented as one stream
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    /// Stream identifier
    pub id: String,
    tracks: Vec<TrackHandle>,
}

impl MediaStream {
    /// Create a stream from tracks
    pub fn new(tracks: Vec<TrackHandle>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// All tracks
    pub fn tracks(&self) -> &[TrackHandle] {
        &self.tracks
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<TrackHandle> {
        self.first_of(TrackKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<TrackHandle> {
        self.first_of(TrackKind::Video)
    }

    fn first_of(&self, kind: TrackKind) -> Option<TrackHandle> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    /// Add a track; returns false if a track with the same id is present
    pub fn add_track(&mut self, track: TrackHandle) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Remove a track by id
    pub fn remove_track(&mut self, id: &str) -> Option<TrackHandle> {
        let index = self.tracks.iter().position(|t| t.id() == id)?;
        Some(self.tracks.remove(index))
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Whether every track has ended
    pub fn all_ended(&self) -> bool {
        self.tracks
            .iter()
            .all(|t| t.ready_state() == TrackState::Ended)
    }

    /// Whether the stream has no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Capture the microphone
    pub audio: bool,
    /// Capture a camera with the given facing
    pub video: Option<FacingMode>,
}

impl CaptureRequest {
    /// Microphone only
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Microphone and camera
    pub fn audio_video(facing: FacingMode) -> Self {
        Self {
            audio: true,
            video: Some(facing),
        }
    }

    /// Camera only, used when switching cameras mid-call
    pub fn video_only(facing: FacingMode) -> Self {
        Self {
            audio: false,
            video: Some(facing),
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested devices
    ///
    /// May suspend for as long as the platform permission prompt is showing.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PermissionDenied`] if the user refused access,
    /// or [`MediaError::DeviceUnavailable`] if a device could not be opened
    async fn get_user_media(&self, request: CaptureRequest) -> Result<MediaStream, MediaError>;
}

/// Peer connection state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed
    Failed,
    /// Closed
    Closed,
}

/// Notification raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Local candidate gathered
    IceCandidate(IceCandidate),
    /// Connection state changed
    ConnectionStateChanged(PeerConnectionState),
    /// Inbound track arrived
    Track(TrackHandle),
}

/// Handle to an outgoing track slot on a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach an outgoing track
    async fn add_track(&self, track: TrackHandle) -> Result<SenderId, PeerError>;

    /// Swap the track behind an existing sender without renegotiating
    async fn replace_track(&self, sender: SenderId, track: TrackHandle) -> Result<(), PeerError>;

    /// Create an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the local description; candidate gathering starts afterwards
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    /// Apply a remote candidate; requires the remote description
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection; idempotent
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection reporting its events to `events`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
