//! Media session management
//!
//! A [`MediaSession`] owns everything media-related for one call attempt: the
//! local capture stream, the peer connection handle and the accumulated
//! remote stream. It is created fresh per attempt and never shared between
//! two calls.
//!
//! User controls (mute, video, speaker) are synchronous flag flips on the
//! local tracks. Switching cameras replaces the outgoing track on the live
//! connection instead of renegotiating.

use crate::runtime::{
    CaptureRequest, MediaDevices, MediaStream, PeerConnection, SenderId, TrackHandle, TrackKind,
};
use crate::types::{FacingMode, MediaFlags, MediaKind};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused device access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The session has no video track (voice call or camera refused)
    #[error("No video track")]
    NoVideoTrack,

    /// Device missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The connection refused the replacement track
    #[error("Track replace failed: {0}")]
    TrackReplaceFailed(String),

    /// Local media has not been acquired
    #[error("Local media not acquired")]
    NotAcquired,

    /// The session was released while the operation was pending
    #[error("Media session released")]
    Released,
}

/// Result of a successful acquisition
#[derive(Debug, Clone)]
pub struct LocalMedia {
    /// Captured stream
    pub stream: MediaStream,
    /// Camera was refused and the stream is audio-only
    pub video_denied: bool,
}

#[derive(Default)]
struct SessionState {
    kind: Option<MediaKind>,
    local: Option<MediaStream>,
    remote: MediaStream,
    peer: Option<Arc<dyn PeerConnection>>,
    video_sender: Option<SenderId>,
    flags: MediaFlags,
    video_denied: bool,
    released: bool,
}

/// Media owned by one call attempt
pub struct MediaSession {
    devices: Arc<dyn MediaDevices>,
    state: Mutex<SessionState>,
    /// One camera switch at a time
    switching: tokio::sync::Mutex<()>,
}

impl MediaSession {
    /// Create an empty session; nothing is captured until
    /// [`acquire_local_media`](Self::acquire_local_media)
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Mutex::new(SessionState::default()),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Capture local media for a call of the given kind
    ///
    /// Voice calls request the microphone only. When a video call's camera
    /// request is refused and `allow_audio_fallback` is set, the microphone
    /// is requested on its own and the result is flagged `video_denied`.
    ///
    /// # Errors
    ///
    /// Returns error if the devices cannot be opened, or if the session was
    /// released while the request was pending (the late stream is stopped)
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    pub async fn acquire_local_media(
        &self,
        kind: MediaKind,
        facing: FacingMode,
        allow_audio_fallback: bool,
    ) -> Result<LocalMedia, MediaError> {
        let request = match kind {
            MediaKind::Video => CaptureRequest::audio_video(facing),
            MediaKind::Voice => CaptureRequest::audio_only(),
        };

        let (stream, video_denied) = match self.devices.get_user_media(request).await {
            Ok(stream) => (stream, false),
            Err(MediaError::PermissionDenied(reason))
                if kind.has_video() && allow_audio_fallback =>
            {
                tracing::warn!(%reason, "Camera refused, continuing audio-only");
                let stream = self
                    .devices
                    .get_user_media(CaptureRequest::audio_only())
                    .await?;
                (stream, true)
            }
            Err(e) => return Err(e),
        };

        let mut state = self.state.lock();
        if state.released {
            drop(state);
            tracing::debug!("Session released during acquisition, stopping late stream");
            stream.stop_all();
            return Err(MediaError::Released);
        }

        let has_video = stream.video_track().is_some();
        state.kind = Some(kind);
        state.video_denied = video_denied;
        state.flags = MediaFlags {
            muted: false,
            video_enabled: kind.has_video() && has_video,
            speaker_on: !kind.has_video(),
            facing_mode: facing,
        };
        state.local = Some(stream.clone());
        drop(state);

        tracing::info!(
            tracks = stream.tracks().len(),
            video_denied,
            "Local media acquired"
        );
        Ok(LocalMedia {
            stream,
            video_denied,
        })
    }

    /// Take ownership of the peer connection and attach every local track
    ///
    /// # Errors
    ///
    /// Returns error if the connection refuses a track
    pub async fn attach_peer(
        &self,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<(), crate::runtime::PeerError> {
        let tracks = {
            let mut state = self.state.lock();
            state.peer = Some(peer.clone());
            state
                .local
                .as_ref()
                .map(|s| s.tracks().to_vec())
                .unwrap_or_default()
        };

        for track in tracks {
            let sender = peer.add_track(track.clone()).await?;
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Local track attached");
            if track.kind() == TrackKind::Video {
                self.state.lock().video_sender = Some(sender);
            }
        }
        Ok(())
    }

    /// Flip the outgoing audio; returns the new muted state
    ///
    /// # Errors
    ///
    /// Returns error if no audio track was acquired
    pub fn toggle_mute(&self) -> Result<bool, MediaError> {
        let mut state = self.state.lock();
        let track = state
            .local
            .as_ref()
            .and_then(MediaStream::audio_track)
            .ok_or(MediaError::NotAcquired)?;
        state.flags.muted = !state.flags.muted;
        track.set_enabled(!state.flags.muted);
        Ok(state.flags.muted)
    }

    /// Flip the outgoing video; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error for voice calls and for video calls whose camera was refused
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        let mut state = self.state.lock();
        if state.kind == Some(MediaKind::Voice) {
            return Err(MediaError::NoVideoTrack);
        }
        let track = state
            .local
            .as_ref()
            .and_then(MediaStream::video_track)
            .ok_or(MediaError::NoVideoTrack)?;
        state.flags.video_enabled = !state.flags.video_enabled;
        track.set_enabled(state.flags.video_enabled);
        Ok(state.flags.video_enabled)
    }

    /// Flip the output route; returns whether the loudspeaker is on
    pub fn toggle_speaker(&self) -> bool {
        let mut state = self.state.lock();
        state.flags.speaker_on = !state.flags.speaker_on;
        state.flags.speaker_on
    }

    /// Switch to the opposite camera
    ///
    /// The replacement is captured and swapped onto the connection before the
    /// current track is stopped, so a failure at any step leaves the original
    /// track sending.
    ///
    /// # Errors
    ///
    /// Returns error if there is no video track, the other camera cannot be
    /// opened, or the connection refuses the new track
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self) -> Result<FacingMode, MediaError> {
        let _switching = self.switching.lock().await;
        let (current, target, peer, sender, enabled) = {
            let state = self.state.lock();
            let current = state
                .local
                .as_ref()
                .and_then(MediaStream::video_track)
                .ok_or(MediaError::NoVideoTrack)?;
            (
                current,
                state.flags.facing_mode.opposite(),
                state.peer.clone(),
                state.video_sender,
                state.flags.video_enabled,
            )
        };

        let replacement_stream = self
            .devices
            .get_user_media(CaptureRequest::video_only(target))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Camera switch failed, keeping current camera");
                e
            })?;
        let Some(replacement) = replacement_stream.video_track() else {
            replacement_stream.stop_all();
            return Err(MediaError::NoVideoTrack);
        };
        replacement.set_enabled(enabled);

        if let (Some(peer), Some(sender)) = (peer, sender) {
            if let Err(e) = peer.replace_track(sender, replacement.clone()).await {
                tracing::warn!(error = %e, "Track replace failed, keeping current camera");
                replacement_stream.stop_all();
                return Err(MediaError::TrackReplaceFailed(e.to_string()));
            }
        }

        let mut state = self.state.lock();
        if state.released {
            drop(state);
            replacement_stream.stop_all();
            return Err(MediaError::Released);
        }
        if let Some(local) = state.local.as_mut() {
            local.remove_track(current.id());
            local.add_track(replacement.clone());
        }
        state.flags.facing_mode = target;
        drop(state);

        current.stop();
        tracing::info!(facing = ?target, track_id = %replacement.id(), "Camera switched");
        Ok(target)
    }

    /// Stop every local and remote track; safe to call more than once
    pub fn release_local_media(&self) {
        let (local, remote) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            (state.local.clone(), state.remote.clone())
        };
        if let Some(local) = local {
            local.stop_all();
        }
        remote.stop_all();
        tracing::debug!("Local media released");
    }

    /// Give up the peer connection handle; the owner of the connection closes it
    pub fn detach_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        let mut state = self.state.lock();
        state.video_sender = None;
        state.peer.take()
    }

    /// Append an inbound track to the remote stream
    ///
    /// Returns false for duplicates and for tracks arriving after release
    /// (those are stopped immediately).
    pub fn add_remote_track(&self, track: TrackHandle) -> bool {
        let mut state = self.state.lock();
        if state.released {
            drop(state);
            track.stop();
            return false;
        }
        state.remote.add_track(track)
    }

    /// Current control flags
    pub fn flags(&self) -> MediaFlags {
        self.state.lock().flags
    }

    /// Whether the camera was refused
    pub fn video_denied(&self) -> bool {
        self.state.lock().video_denied
    }

    /// Local capture stream
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.state.lock().local.clone()
    }

    /// Accumulated remote stream
    pub fn remote_stream(&self) -> MediaStream {
        self.state.lock().remote.clone()
    }

    /// Active peer connection
    pub fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.state.lock().peer.clone()
    }

    /// Whether the session has been released
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::{MediaTrack, PeerConnectionFactory, TrackState};
    use crate::sim::{SimMediaDevices, SimNetwork};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn session(devices: &SimMediaDevices) -> MediaSession {
        MediaSession::new(Arc::new(devices.clone()))
    }

    #[tokio::test]
    async fn test_video_call_acquires_both_tracks() {
        let devices = SimMediaDevices::new();
        let media = session(&devices);

        let local = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();

        assert!(!local.video_denied);
        assert!(local.stream.audio_track().is_some());
        assert!(local.stream.video_track().is_some());
        let flags = media.flags();
        assert!(flags.video_enabled);
        assert!(!flags.speaker_on);
    }

    #[tokio::test]
    async fn test_voice_call_never_requests_camera() {
        let devices = SimMediaDevices::new();
        let media = session(&devices);

        media
            .acquire_local_media(MediaKind::Voice, FacingMode::User, true)
            .await
            .unwrap();

        assert_eq!(devices.requests(), vec![CaptureRequest::audio_only()]);
        assert!(media.flags().speaker_on);
        assert_eq!(media.toggle_video(), Err(MediaError::NoVideoTrack));
    }

    #[tokio::test]
    async fn test_camera_denied_falls_back_to_audio() {
        let devices = SimMediaDevices::new();
        devices.deny_camera(true);
        let media = session(&devices);

        let local = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();

        assert!(local.video_denied);
        assert!(local.stream.video_track().is_none());
        assert!(local.stream.audio_track().is_some());
        assert!(!media.flags().video_enabled);
        assert_eq!(media.toggle_video(), Err(MediaError::NoVideoTrack));
    }

    #[tokio::test]
    async fn test_camera_denied_without_fallback_fails() {
        let devices = SimMediaDevices::new();
        devices.deny_camera(true);
        let media = session(&devices);

        let result = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, false)
            .await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_microphone_denied_fails_voice_call() {
        let devices = SimMediaDevices::new();
        devices.deny_microphone(true);
        let media = session(&devices);

        let result = media
            .acquire_local_media(MediaKind::Voice, FacingMode::User, true)
            .await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_toggles_flip_track_enabled() {
        let devices = SimMediaDevices::new();
        let media = session(&devices);
        let local = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();
        let audio = local.stream.audio_track().unwrap();
        let video = local.stream.video_track().unwrap();

        assert_eq!(media.toggle_mute(), Ok(true));
        assert!(!audio.is_enabled());
        assert_eq!(media.toggle_mute(), Ok(false));
        assert!(audio.is_enabled());

        assert_eq!(media.toggle_video(), Ok(false));
        assert!(!video.is_enabled());

        assert!(media.toggle_speaker());
        assert!(!media.toggle_speaker());
    }

    #[tokio::test]
    async fn test_toggle_mute_before_acquire() {
        let media = session(&SimMediaDevices::new());
        assert_eq!(media.toggle_mute(), Err(MediaError::NotAcquired));
    }

    #[tokio::test]
    async fn test_switch_camera_replaces_sender_track() {
        let devices = SimMediaDevices::new();
        let network = SimNetwork::new();
        let media = session(&devices);
        let local = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();
        let original = local.stream.video_track().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = network.factory("alice").create(&[], tx).await.unwrap();
        media.attach_peer(pc).await.unwrap();

        let facing = media.switch_camera().await.unwrap();
        assert_eq!(facing, FacingMode::Environment);
        assert_eq!(original.ready_state(), TrackState::Ended);

        let current = media.local_stream().unwrap().video_track().unwrap();
        assert_ne!(current.id(), original.id());
        assert_eq!(current.ready_state(), TrackState::Live);

        let connection = network.connections().pop().unwrap();
        let sent: Vec<String> = connection
            .senders()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        assert!(sent.contains(&current.id().to_string()));
        assert!(!sent.contains(&original.id().to_string()));
        assert_eq!(media.flags().facing_mode, FacingMode::Environment);
    }

    #[tokio::test]
    async fn test_switch_camera_failure_keeps_original_track() {
        let devices = SimMediaDevices::new();
        let network = SimNetwork::new();
        let media = session(&devices);
        let local = media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();
        let original = local.stream.video_track().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = network.factory("alice").create(&[], tx).await.unwrap();
        media.attach_peer(pc).await.unwrap();

        devices.deny_camera(true);
        let result = media.switch_camera().await;

        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert_eq!(original.ready_state(), TrackState::Live);
        let current = media.local_stream().unwrap().video_track().unwrap();
        assert_eq!(current.id(), original.id());
        let connection = network.connections().pop().unwrap();
        assert!(connection.senders().iter().any(|t| t.id() == original.id()));
        assert_eq!(media.flags().facing_mode, FacingMode::User);
    }

    #[tokio::test]
    async fn test_concurrent_switches_leave_one_live_camera() {
        let devices = SimMediaDevices::new();
        let media = Arc::new(session(&devices));
        media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();

        devices.hold_requests(true);
        let first = tokio::spawn({
            let media = media.clone();
            async move { media.switch_camera().await }
        });
        let second = tokio::spawn({
            let media = media.clone();
            async move { media.switch_camera().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(devices.requests().len(), 2);
        devices.hold_requests(false);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let current = media.local_stream().unwrap().video_track().unwrap();
        assert_eq!(media.flags().facing_mode, FacingMode::User);
        let live: Vec<_> = devices
            .issued_tracks()
            .into_iter()
            .filter(|t| t.kind() == TrackKind::Video && t.ready_state() == TrackState::Live)
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id(), current.id());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_stops_everything() {
        let devices = SimMediaDevices::new();
        let media = session(&devices);
        media
            .acquire_local_media(MediaKind::Video, FacingMode::User, true)
            .await
            .unwrap();

        media.release_local_media();
        media.release_local_media();

        assert!(media.local_stream().unwrap().all_ended());
        assert!(devices
            .issued_tracks()
            .iter()
            .all(|t| t.ready_state() == TrackState::Ended));
    }

    #[tokio::test]
    async fn test_release_during_pending_acquisition_stops_late_stream() {
        let devices = SimMediaDevices::new();
        devices.hold_requests(true);
        let media = Arc::new(session(&devices));

        let pending = tokio::spawn({
            let media = media.clone();
            async move {
                media
                    .acquire_local_media(MediaKind::Voice, FacingMode::User, true)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        media.release_local_media();
        devices.hold_requests(false);

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), MediaError::Released);
        assert!(devices
            .issued_tracks()
            .iter()
            .all(|t| t.ready_state() == TrackState::Ended));
    }

    #[tokio::test]
    async fn test_remote_tracks_accumulate_once() {
        let devices = SimMediaDevices::new();
        let media = session(&devices);
        let remote = SimMediaDevices::new();
        let stream = remote
            .get_user_media(CaptureRequest::audio_video(FacingMode::User))
            .await
            .unwrap();

        for track in stream.tracks() {
            assert!(media.add_remote_track(track.clone()));
        }
        assert!(!media.add_remote_track(stream.tracks()[0].clone()));
        assert_eq!(media.remote_stream().tracks().len(), 2);

        media.release_local_media();
        assert!(stream.all_ended());
    }
}
