//! Call lifecycle management
//!
//! [`CallManager`] is the surface the UI shell talks to. It turns user
//! actions into call sessions, bridges the incoming-call watch into
//! notifications, and guarantees that at most one session exists at a time.
//! Each session runs as its own task driving a [`Negotiator`]; the manager
//! only routes commands to it and publishes its outcome.
//!
//! State is exposed two ways: a [`CallSnapshot`] through a `watch` channel
//! for rendering, and discrete [`CallEvent`]s through a `broadcast` channel
//! for notifications.

use crate::identity::{IdentityError, UserId};
use crate::media::{MediaError, MediaSession};
use crate::negotiation::{CallReporter, Negotiator, SessionCommand, SessionEnd, SessionSetup};
use crate::runtime::{MediaDevices, MediaStream, PeerConnectionFactory, PeerError};
use crate::signaling::{SignalingChannel, SignalingError, SignalingHandler};
use crate::types::{
    CallEvent, CallId, CallPhase, CallRecord, CallSnapshot, EndReason, FacingMode, IceServer,
    MediaFlags, MediaKind, NegotiationRole, OfferPayload,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Incoming records kept while busy, for glare promotion
const MAX_DEFERRED_INCOMING: usize = 4;

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is already in progress
    #[error("Already in a call")]
    AlreadyInCall,

    /// No incoming call waiting for an answer
    #[error("No incoming call")]
    NoIncomingCall,

    /// No call in progress
    #[error("No active call")]
    NoActiveCall,

    /// Media access refused
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    /// Signaling store rejected a write
    #[error("Signaling write failed: {0}")]
    SignalingWriteFailed(String),

    /// The call record vanished
    #[error("Call no longer available: {0}")]
    NotFound(String),

    /// The peer is blocked
    #[error("Peer is blocked: {0}")]
    PeerBlocked(UserId),

    /// Invalid user id
    #[error("Invalid user id: {0}")]
    InvalidUserId(#[from] IdentityError),

    /// Calling yourself
    #[error("Cannot call yourself")]
    SelfCall,

    /// Peer connection runtime failure
    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// Media failure other than permission
    #[error("Media error: {0}")]
    Media(MediaError),

    /// The peer dialed at the same time and their call won
    #[error("Call collided with an incoming call")]
    CallCollision,

    /// The call was ended before the request completed
    #[error("Call was cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl CallError {
    /// Text shown to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::AlreadyInCall => "You are already in a call.",
            Self::NoIncomingCall => "There is no incoming call.",
            Self::NoActiveCall => "There is no active call.",
            Self::PermissionDenied(_) => EndReason::PermissionDenied.user_message(),
            Self::SignalingWriteFailed(_) => EndReason::SignalingFailed.user_message(),
            Self::NotFound(_) => EndReason::NoLongerAvailable.user_message(),
            Self::PeerBlocked(_) => "You cannot call a blocked user.",
            Self::InvalidUserId(_) => "That user id is not valid.",
            Self::SelfCall => "You cannot call yourself.",
            Self::PeerConnectionFailed(_) => EndReason::ConnectionFailed.user_message(),
            Self::Media(MediaError::NoVideoTrack) => "Video is not available in this call.",
            Self::Media(_) => EndReason::MediaUnavailable.user_message(),
            Self::CallCollision => EndReason::CallCollision.user_message(),
            Self::Cancelled => "Call was cancelled.",
            Self::ConfigError(_) => "Invalid call configuration.",
        }
    }

    /// Reason a session ends with when this error aborts it
    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::PermissionDenied(_) => Some(EndReason::PermissionDenied),
            Self::SignalingWriteFailed(_) => Some(EndReason::SignalingFailed),
            Self::NotFound(_) => Some(EndReason::NoLongerAvailable),
            Self::PeerConnectionFailed(_) => Some(EndReason::ConnectionFailed),
            Self::Media(MediaError::Released) | Self::Cancelled => Some(EndReason::LocalHangup),
            Self::Media(_) => Some(EndReason::MediaUnavailable),
            Self::CallCollision => Some(EndReason::CallCollision),
            Self::AlreadyInCall
            | Self::NoIncomingCall
            | Self::NoActiveCall
            | Self::PeerBlocked(_)
            | Self::InvalidUserId(_)
            | Self::SelfCall
            | Self::ConfigError(_) => None,
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(reason) => CallError::PermissionDenied(reason),
            other => CallError::Media(other),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        CallError::PeerConnectionFailed(err.to_string())
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::NotFound(call_id) => CallError::NotFound(call_id.to_string()),
            SignalingError::AlreadyExists(_) => CallError::CallCollision,
            other => CallError::SignalingWriteFailed(other.to_string()),
        }
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// Continue a video call audio-only when the camera is refused
    pub audio_fallback_on_video_denied: bool,
    /// Stamp each call attempt so a redial never reuses a stale record
    pub unique_attempt_ids: bool,
    /// Bound on the best-effort record delete during teardown
    pub teardown_timeout_ms: u64,
    /// Call duration refresh period
    pub duration_tick_ms: u64,
    /// Event channel capacity
    pub event_capacity: usize,
    /// Camera used when a video call starts
    pub default_facing_mode: FacingMode,
    /// Users who can neither call nor be called
    pub blocked_peers: Vec<UserId>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            audio_fallback_on_video_denied: true,
            unique_attempt_ids: true,
            teardown_timeout_ms: 2000,
            duration_tick_ms: 1000,
            event_capacity: 100,
            default_facing_mode: FacingMode::User,
            blocked_peers: Vec::new(),
        }
    }
}

impl CallManagerConfig {
    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns error if a period or capacity is zero
    pub fn validate(&self) -> Result<(), CallError> {
        if self.event_capacity == 0 {
            return Err(CallError::ConfigError(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.duration_tick_ms == 0 {
            return Err(CallError::ConfigError(
                "duration_tick_ms must be at least 1".to_string(),
            ));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(CallError::ConfigError(
                "teardown_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

struct ActiveSession {
    call_id: CallId,
    role: NegotiationRole,
    peer: UserId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    media: Arc<MediaSession>,
    accepted: bool,
    generation: u64,
}

#[derive(Default)]
struct ManagerState {
    active: Option<ActiveSession>,
    deferred: VecDeque<CallRecord>,
    blocked: HashSet<UserId>,
    next_generation: u64,
}

struct ManagerInner<C: SignalingChannel> {
    local_user: UserId,
    signaling: Arc<SignalingHandler<C>>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: Arc<CallManagerConfig>,
    state: Mutex<ManagerState>,
    reporter: CallReporter,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<C: SignalingChannel> Drop for ManagerInner<C> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

/// Call manager
///
/// Cheap to clone; clones share the same session state.
pub struct CallManager<C: SignalingChannel> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: SignalingChannel> Clone for CallManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: SignalingChannel + 'static> ManagerInner<C> {
    /// Install a new session as the active one
    fn claim(
        &self,
        state: &mut ManagerState,
        call_id: CallId,
        role: NegotiationRole,
        peer: UserId,
        kind: MediaKind,
        offer: Option<OfferPayload>,
    ) -> (Negotiator<C>, mpsc::UnboundedReceiver<SessionCommand>, u64) {
        state.next_generation += 1;
        let generation = state.next_generation;
        let media = Arc::new(MediaSession::new(self.devices.clone()));
        let (commands, receiver) = mpsc::unbounded_channel();

        state.active = Some(ActiveSession {
            call_id: call_id.clone(),
            role,
            peer: peer.clone(),
            commands,
            media: media.clone(),
            accepted: false,
            generation,
        });

        let facing_mode = self.config.default_facing_mode;
        self.reporter.update(|s| {
            *s = CallSnapshot {
                phase: CallPhase::Idle,
                call_id: Some(call_id.clone()),
                role: Some(role),
                peer: Some(peer.clone()),
                kind: Some(kind),
                duration_secs: 0,
                flags: MediaFlags {
                    muted: false,
                    video_enabled: kind.has_video(),
                    speaker_on: !kind.has_video(),
                    facing_mode,
                },
                video_denied: false,
                end_reason: None,
            };
        });

        let negotiator = Negotiator::new(SessionSetup {
            call_id,
            role,
            local_user: self.local_user.clone(),
            peer_user: peer,
            kind,
            offer,
            signaling: self.signaling.clone(),
            peers: self.peers.clone(),
            media,
            config: self.config.clone(),
            reporter: self.reporter.clone(),
        });
        (negotiator, receiver, generation)
    }

    fn spawn_session(
        self: &Arc<Self>,
        negotiator: Negotiator<C>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        started: Option<oneshot::Sender<Result<(), CallError>>>,
        generation: u64,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            let end = negotiator.run(commands, started).await;
            inner.finish_session(generation, end);
        });
    }

    fn finish_session(self: &Arc<Self>, generation: u64, end: SessionEnd) {
        let (finished, promote) = {
            let mut state = self.state.lock();
            let finished = match &state.active {
                Some(active) if active.generation == generation => state.active.take(),
                _ => None,
            };
            let colliding = if end.reason == EndReason::CallCollision {
                state
                    .deferred
                    .iter()
                    .position(|r| r.caller() == Some(&end.peer))
            } else {
                None
            };
            let promote = colliding.and_then(|index| state.deferred.remove(index));
            for record in state.deferred.drain(..) {
                tracing::info!(call_id = %record.call_id, "Dropping incoming call that arrived while busy");
            }
            (finished, promote)
        };

        if let Some(active) = finished {
            let never_presented =
                active.role == NegotiationRole::Callee && end.last_phase == CallPhase::Idle;
            if never_presented {
                self.reporter.update(|s| *s = CallSnapshot::default());
            } else {
                let flags = active.media.flags();
                self.reporter.update(|s| {
                    s.phase = CallPhase::Ended;
                    s.end_reason = Some(end.reason);
                    s.flags = flags;
                });
                self.reporter.emit(CallEvent::PhaseChanged {
                    call_id: active.call_id.clone(),
                    phase: CallPhase::Ended,
                });
                self.reporter.emit(CallEvent::CallEnded {
                    call_id: active.call_id.clone(),
                    reason: end.reason,
                });
            }
        }

        if let Some((reply, error)) = end.failed_reply {
            let _ = reply.send(Err(error));
        }
        for waiter in end.waiters {
            let _ = waiter.send(());
        }

        if let Some(record) = promote {
            tracing::info!(call_id = %record.call_id, "Promoting colliding incoming call");
            self.begin_incoming(record);
        }
    }

    fn begin_incoming(self: &Arc<Self>, record: CallRecord) {
        let Some(offer) = record.offer.clone() else {
            return;
        };
        let caller = offer.caller_id.clone();
        if record.callee() != Some(&self.local_user) {
            return;
        }

        let mut state = self.state.lock();
        if state.blocked.contains(&caller) {
            tracing::info!(call_id = %record.call_id, caller = %caller, "Ignoring call from blocked user");
            return;
        }

        if let Some(active) = &state.active {
            if active.role == NegotiationRole::Callee && active.call_id == record.call_id {
                return;
            }

            let snapshot = self.reporter.snapshot();
            let outgoing_pending = active.role == NegotiationRole::Caller
                && active.peer == caller
                && snapshot.call_id.as_ref() == Some(&active.call_id)
                && matches!(
                    snapshot.phase,
                    CallPhase::Idle | CallPhase::Initiating | CallPhase::AwaitingAnswer
                );
            let give_way = outgoing_pending && self.local_user > caller;
            let commands = active.commands.clone();

            if !state.deferred.iter().any(|r| r.call_id == record.call_id) {
                if state.deferred.len() == MAX_DEFERRED_INCOMING {
                    state.deferred.pop_front();
                }
                state.deferred.push_back(record.clone());
            }
            drop(state);

            if give_way {
                tracing::info!(call_id = %record.call_id, "Both sides dialed, giving way to incoming call");
                let _ = commands.send(SessionCommand::Yield);
            } else {
                tracing::info!(call_id = %record.call_id, caller = %caller, "Incoming call while busy");
            }
            return;
        }

        let (negotiator, commands, generation) = self.claim(
            &mut state,
            record.call_id.clone(),
            NegotiationRole::Callee,
            caller,
            offer.media_kind,
            Some(offer),
        );
        drop(state);
        self.spawn_session(negotiator, commands, None, generation);
    }

    fn active_media(&self) -> Result<(CallId, Arc<MediaSession>), CallError> {
        let state = self.state.lock();
        let active = state.active.as_ref().ok_or(CallError::NoActiveCall)?;
        Ok((active.call_id.clone(), active.media.clone()))
    }

    fn publish_flags(&self, media: &MediaSession) {
        let flags = media.flags();
        self.reporter.update(|s| s.flags = flags);
    }
}

impl<C: SignalingChannel + 'static> CallManager<C> {
    /// Create a builder
    #[must_use]
    pub fn builder(local_user: UserId, signaling: Arc<C>) -> CallManagerBuilder<C> {
        CallManagerBuilder::new(local_user, signaling)
    }

    /// Start listening for incoming calls
    ///
    /// # Errors
    ///
    /// Returns error if the incoming-call watch cannot be opened
    #[tracing::instrument(skip(self), fields(user = %self.inner.local_user))]
    pub async fn start(&self) -> Result<(), CallError> {
        let mut incoming = self
            .inner
            .signaling
            .watch_incoming_calls(&self.inner.local_user)
            .await?;

        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while let Some(record) = incoming.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.begin_incoming(record);
            }
        });

        if let Some(previous) = self.inner.listener.lock().replace(listener) {
            previous.abort();
        }
        tracing::info!("Listening for incoming calls");
        Ok(())
    }

    /// Call `peer`
    ///
    /// Returns once local media is captured and the offer is written, so
    /// permission and signaling failures surface here.
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress, the peer is blocked, or the
    /// call could not be set up
    #[tracing::instrument(skip(self), fields(peer = %peer, kind = %kind))]
    pub async fn start_call(&self, peer: &UserId, kind: MediaKind) -> Result<CallId, CallError> {
        let inner = &self.inner;
        if *peer == inner.local_user {
            return Err(CallError::SelfCall);
        }

        let call_id = if inner.config.unique_attempt_ids {
            CallId::next_attempt(&inner.local_user, peer)
        } else {
            CallId::for_pair(&inner.local_user, peer)
        };

        let (started, started_rx) = oneshot::channel();
        {
            let mut state = inner.state.lock();
            if state.blocked.contains(peer) {
                return Err(CallError::PeerBlocked(peer.clone()));
            }
            if state.active.is_some() {
                return Err(CallError::AlreadyInCall);
            }
            let (negotiator, commands, generation) = inner.claim(
                &mut state,
                call_id.clone(),
                NegotiationRole::Caller,
                peer.clone(),
                kind,
                None,
            );
            drop(state);
            inner.spawn_session(negotiator, commands, Some(started), generation);
        }

        tracing::info!(call_id = %call_id, "Starting call");
        match started_rx.await {
            Ok(Ok(())) => Ok(call_id),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CallError::Cancelled),
        }
    }

    /// Accept the incoming call
    ///
    /// Returns once the answer is written.
    ///
    /// # Errors
    ///
    /// Returns error if there is no incoming call, it vanished, or media
    /// could not be captured
    #[tracing::instrument(skip(self))]
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        let (reply, reply_rx) = oneshot::channel();
        let call_id = {
            let mut state = self.inner.state.lock();
            let active = state
                .active
                .as_mut()
                .filter(|a| a.role == NegotiationRole::Callee && !a.accepted)
                .ok_or(CallError::NoIncomingCall)?;
            active
                .commands
                .send(SessionCommand::Accept(reply))
                .map_err(|_| CallError::NoIncomingCall)?;
            active.accepted = true;
            active.call_id.clone()
        };

        tracing::info!(call_id = %call_id, "Accepting call");
        reply_rx
            .await
            .unwrap_or_else(|_| Err(CallError::NotFound(call_id.to_string())))
    }

    /// Decline the incoming call
    ///
    /// # Errors
    ///
    /// Returns error if there is no incoming call
    #[tracing::instrument(skip(self))]
    pub async fn reject_incoming(&self) -> Result<(), CallError> {
        let (done, done_rx) = oneshot::channel();
        {
            let state = self.inner.state.lock();
            let active = state
                .active
                .as_ref()
                .filter(|a| a.role == NegotiationRole::Callee && !a.accepted)
                .ok_or(CallError::NoIncomingCall)?;
            tracing::info!(call_id = %active.call_id, "Rejecting call");
            if active.commands.send(SessionCommand::Reject(done)).is_err() {
                return Ok(());
            }
        }
        let _ = done_rx.await;
        Ok(())
    }

    /// Hang up, whatever state the call is in
    ///
    /// Returns after local teardown; the record delete runs in the background.
    ///
    /// # Errors
    ///
    /// Returns error if there is no call
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (done, done_rx) = oneshot::channel();
        {
            let state = self.inner.state.lock();
            let active = state.active.as_ref().ok_or(CallError::NoActiveCall)?;
            tracing::info!(call_id = %active.call_id, "Ending call");
            if active.commands.send(SessionCommand::Hangup(done)).is_err() {
                return Ok(());
            }
        }
        let _ = done_rx.await;
        Ok(())
    }

    /// Flip mute; returns whether the microphone is now muted
    ///
    /// # Errors
    ///
    /// Returns error if there is no call or no microphone track
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let (_, media) = self.inner.active_media()?;
        let muted = media.toggle_mute()?;
        self.inner.publish_flags(&media);
        Ok(muted)
    }

    /// Flip the camera; returns whether video is now sent
    ///
    /// # Errors
    ///
    /// Returns error if there is no call or no video track
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let (_, media) = self.inner.active_media()?;
        let enabled = media.toggle_video()?;
        self.inner.publish_flags(&media);
        Ok(enabled)
    }

    /// Flip the loudspeaker; returns whether it is now on
    ///
    /// # Errors
    ///
    /// Returns error if there is no call
    pub fn toggle_speaker(&self) -> Result<bool, CallError> {
        let (_, media) = self.inner.active_media()?;
        let on = media.toggle_speaker();
        self.inner.publish_flags(&media);
        Ok(on)
    }

    /// Switch between front and rear camera
    ///
    /// A failure leaves the current camera in place and is reported as a
    /// [`CallEvent::ControlFailed`]; the call continues.
    ///
    /// # Errors
    ///
    /// Returns error if there is no call or the switch failed
    #[tracing::instrument(skip(self))]
    pub async fn switch_camera(&self) -> Result<FacingMode, CallError> {
        let (call_id, media) = self.inner.active_media()?;
        match media.switch_camera().await {
            Ok(facing) => {
                self.inner.publish_flags(&media);
                Ok(facing)
            }
            Err(e) => {
                self.inner.reporter.emit(CallEvent::ControlFailed {
                    call_id,
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Local capture stream of the current call
    pub fn local_stream(&self) -> Option<MediaStream> {
        let (_, media) = self.inner.active_media().ok()?;
        media.local_stream()
    }

    /// Remote stream of the current call
    pub fn remote_stream(&self) -> Option<MediaStream> {
        let (_, media) = self.inner.active_media().ok()?;
        Some(media.remote_stream())
    }

    /// Block or unblock a user
    pub fn set_blocked(&self, user: &UserId, blocked: bool) {
        let mut state = self.inner.state.lock();
        if blocked {
            state.blocked.insert(user.clone());
        } else {
            state.blocked.remove(user);
        }
    }

    /// Whether a user is blocked
    pub fn is_blocked(&self, user: &UserId) -> bool {
        self.inner.state.lock().blocked.contains(user)
    }

    /// Current call state
    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.reporter.snapshot()
    }

    /// Subscribe to call state
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.reporter.subscribe_state()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.reporter.subscribe_events()
    }

    /// Local user
    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    /// Active configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Stop listening and end any call in progress
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        let _ = self.end_call().await;
        tracing::info!("Call manager shut down");
    }
}

/// Call manager builder
pub struct CallManagerBuilder<C: SignalingChannel> {
    local_user: UserId,
    signaling: Arc<C>,
    devices: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    config: CallManagerConfig,
}

impl<C: SignalingChannel + 'static> CallManagerBuilder<C> {
    /// Create new builder
    #[must_use]
    pub fn new(local_user: UserId, signaling: Arc<C>) -> Self {
        Self {
            local_user,
            signaling,
            devices: None,
            peers: None,
            config: CallManagerConfig::default(),
        }
    }

    /// Set capture devices
    #[must_use]
    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager
    ///
    /// # Errors
    ///
    /// Returns error if devices or the peer factory are missing, or the
    /// configuration is invalid
    pub fn build(self) -> Result<CallManager<C>, CallError> {
        self.config.validate()?;
        let devices = self
            .devices
            .ok_or_else(|| CallError::ConfigError("media devices not set".to_string()))?;
        let peers = self
            .peers
            .ok_or_else(|| CallError::ConfigError("peer connection factory not set".to_string()))?;

        let state = ManagerState {
            blocked: self.config.blocked_peers.iter().cloned().collect(),
            ..ManagerState::default()
        };
        let reporter = CallReporter::new(self.config.event_capacity);

        Ok(CallManager {
            inner: Arc::new(ManagerInner {
                local_user: self.local_user,
                signaling: Arc::new(SignalingHandler::new(self.signaling)),
                devices,
                peers,
                config: Arc::new(self.config),
                state: Mutex::new(state),
                reporter,
                listener: Mutex::new(None),
            }),
        })
    }
}
