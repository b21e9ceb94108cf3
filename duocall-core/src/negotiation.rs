//! Call negotiation state machine
//!
//! One [`Negotiator`] drives one call attempt through the offer/answer and
//! trickle ICE exchange, for either role. Every transition is a reaction to a
//! named input: a user command, a record change, a remote candidate, a peer
//! connection event or a duration tick. All of them are multiplexed in a
//! single `select!` loop, so there is never more than one transition in
//! flight for a call.
//!
//! ```text
//!  Caller                      Callee
//!    Idle                        Idle
//!     │ start_call                │ incoming record
//!     ▼                           ▼
//!  Initiating                  Offered ──── reject ───┐
//!     │ offer written             │ accept            │
//!     ▼                           ▼                   │
//!  AwaitingAnswer ─ answer ─▶  Answered               │
//!                                 │ peer connected    │
//!                                 ▼                   │
//!                              Connected              │
//!                                 │                   │
//!                                 ▼                   │
//!                               Ended ◀───────────────┘  (reachable from every state)
//! ```

use crate::call::{CallError, CallManagerConfig};
use crate::identity::UserId;
use crate::media::MediaSession;
use crate::runtime::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use crate::signaling::{RecordEvent, SignalingChannel, SignalingHandler, Subscription};
use crate::types::{
    AnswerPayload, CallEvent, CallId, CallPhase, CallSnapshot, EndReason, IceCandidate,
    MediaKind, NegotiationRole, OfferPayload,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Remote candidates held back until the remote description is applied
///
/// A candidate can only be applied once the connection knows the remote
/// description it belongs to. Until then candidates are queued, and they are
/// released in arrival order the moment the description is set.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    ready: bool,
    pending: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    /// Empty buffer, remote description not yet applied
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it can be applied now, otherwise holds it
    pub fn accept(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.ready {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Record that the remote description is applied and release held candidates
    pub fn mark_ready(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    /// Whether the remote description is applied
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Number of held candidates
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Publishes call state and events to the UI shell
#[derive(Clone)]
pub(crate) struct CallReporter {
    events: broadcast::Sender<CallEvent>,
    state: Arc<watch::Sender<CallSnapshot>>,
}

impl CallReporter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (state, _) = watch::channel(CallSnapshot::default());
        Self {
            events,
            state: Arc::new(state),
        }
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut CallSnapshot)) {
        self.state.send_modify(modify);
    }

    pub(crate) fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<CallSnapshot> {
        self.state.subscribe()
    }
}

/// User input delivered to a running session
pub(crate) enum SessionCommand {
    /// Accept the incoming call; replies once answered
    Accept(oneshot::Sender<Result<(), CallError>>),
    /// Decline the incoming call; replies after teardown
    Reject(oneshot::Sender<()>),
    /// End the call; replies after teardown
    Hangup(oneshot::Sender<()>),
    /// Give way to the peer's simultaneous call
    Yield,
}

/// How a session finished
pub(crate) struct SessionEnd {
    pub(crate) reason: EndReason,
    /// Last phase before teardown; `Idle` means the user never saw the call
    pub(crate) last_phase: CallPhase,
    /// Hangup/reject callers waiting for teardown to finish
    pub(crate) waiters: Vec<oneshot::Sender<()>>,
    /// The other party of the call
    pub(crate) peer: UserId,
    /// Pending start/accept request that failed
    pub(crate) failed_reply: Option<(oneshot::Sender<Result<(), CallError>>, CallError)>,
}

/// Everything a session needs, handed over by the call manager
pub(crate) struct SessionSetup<C: SignalingChannel> {
    pub(crate) call_id: CallId,
    pub(crate) role: NegotiationRole,
    pub(crate) local_user: UserId,
    pub(crate) peer_user: UserId,
    pub(crate) kind: MediaKind,
    pub(crate) offer: Option<OfferPayload>,
    pub(crate) signaling: Arc<SignalingHandler<C>>,
    pub(crate) peers: Arc<dyn PeerConnectionFactory>,
    pub(crate) media: Arc<MediaSession>,
    pub(crate) config: Arc<CallManagerConfig>,
    pub(crate) reporter: CallReporter,
}

/// Drives one call attempt
pub(crate) struct Negotiator<C: SignalingChannel> {
    call_id: CallId,
    role: NegotiationRole,
    local_user: UserId,
    peer_user: UserId,
    kind: MediaKind,
    offer: Option<OfferPayload>,
    signaling: Arc<SignalingHandler<C>>,
    peers: Arc<dyn PeerConnectionFactory>,
    media: Arc<MediaSession>,
    config: Arc<CallManagerConfig>,
    reporter: CallReporter,
    phase: CallPhase,
    pc: Option<Arc<dyn PeerConnection>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    record_watch: Option<Subscription<RecordEvent>>,
    candidate_watch: Option<Subscription<IceCandidate>>,
    buffer: CandidateBuffer,
    owns_record: bool,
    connected_at: Option<Instant>,
    ticker: Option<Interval>,
    duration_secs: u64,
}

async fn next_item<T>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Run `step` to completion unless a command cuts it short
///
/// Returns the reason the session should end if it was interrupted.
async fn interruptible<T>(
    step: impl Future<Output = T>,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    waiters: &mut Vec<oneshot::Sender<()>>,
) -> Result<T, EndReason> {
    tokio::pin!(step);
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(SessionCommand::Accept(reply)) => {
                    let _ = reply.send(Err(CallError::NoIncomingCall));
                }
                Some(SessionCommand::Hangup(done)) => {
                    waiters.push(done);
                    return Err(EndReason::LocalHangup);
                }
                Some(SessionCommand::Reject(done)) => {
                    waiters.push(done);
                    return Err(EndReason::Rejected);
                }
                Some(SessionCommand::Yield) => return Err(EndReason::CallCollision),
                None => return Err(EndReason::LocalHangup),
            },
            output = &mut step => return Ok(output),
        }
    }
}

/// Error reported to a start/accept request cut short by `reason`
fn interrupted_error(reason: EndReason) -> CallError {
    match reason {
        EndReason::CallCollision => CallError::CallCollision,
        _ => CallError::Cancelled,
    }
}

impl<C: SignalingChannel + 'static> Negotiator<C> {
    pub(crate) fn new(setup: SessionSetup<C>) -> Self {
        Self {
            owns_record: setup.role == NegotiationRole::Callee,
            call_id: setup.call_id,
            role: setup.role,
            local_user: setup.local_user,
            peer_user: setup.peer_user,
            kind: setup.kind,
            offer: setup.offer,
            signaling: setup.signaling,
            peers: setup.peers,
            media: setup.media,
            config: setup.config,
            reporter: setup.reporter,
            phase: CallPhase::Idle,
            pc: None,
            peer_events: None,
            record_watch: None,
            candidate_watch: None,
            buffer: CandidateBuffer::new(),
            connected_at: None,
            ticker: None,
            duration_secs: 0,
        }
    }

    /// Run the session until it ends, then tear it down
    ///
    /// For the caller, `started` is answered once the offer is written.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        started: Option<oneshot::Sender<Result<(), CallError>>>,
    ) -> SessionEnd {
        let mut waiters = Vec::new();
        let mut failed_reply = None;

        let reason = match self.role {
            NegotiationRole::Caller => {
                let init = interruptible(self.start_caller(), &mut commands, &mut waiters).await;
                match init {
                    Ok(Ok(())) => {
                        if let Some(started) = started {
                            let _ = started.send(Ok(()));
                        }
                        self.drive(&mut commands, &mut waiters, &mut failed_reply)
                            .await
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(call_id = %self.call_id, error = %error, "Call setup failed");
                        let reason = error.end_reason().unwrap_or(EndReason::ConnectionFailed);
                        if let Some(started) = started {
                            failed_reply = Some((started, error));
                        }
                        reason
                    }
                    Err(reason) => {
                        if let Some(started) = started {
                            failed_reply = Some((started, interrupted_error(reason)));
                        }
                        reason
                    }
                }
            }
            NegotiationRole::Callee => match self.present_incoming().await {
                Ok(()) => {
                    self.drive(&mut commands, &mut waiters, &mut failed_reply)
                        .await
                }
                Err(reason) => reason,
            },
        };

        let last_phase = self.phase;
        self.teardown(reason).await;
        SessionEnd {
            reason,
            last_phase,
            peer: self.peer_user.clone(),
            waiters,
            failed_reply,
        }
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
        waiters: &mut Vec<oneshot::Sender<()>>,
        failed_reply: &mut Option<(oneshot::Sender<Result<(), CallError>>, CallError)>,
    ) -> EndReason {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Accept(reply)) => {
                        if self.phase != CallPhase::Offered {
                            let _ = reply.send(Err(CallError::NoIncomingCall));
                            continue;
                        }
                        let outcome = interruptible(self.accept(), commands, waiters).await;
                        match outcome {
                            Ok(Ok(())) => {
                                let _ = reply.send(Ok(()));
                            }
                            Ok(Err(error)) => {
                                tracing::warn!(call_id = %self.call_id, error = %error, "Accept failed");
                                let reason = error.end_reason().unwrap_or(EndReason::ConnectionFailed);
                                *failed_reply = Some((reply, error));
                                return reason;
                            }
                            Err(reason) => {
                                *failed_reply = Some((reply, interrupted_error(reason)));
                                return reason;
                            }
                        }
                    }
                    Some(SessionCommand::Reject(done)) => {
                        waiters.push(done);
                        return EndReason::Rejected;
                    }
                    Some(SessionCommand::Hangup(done)) => {
                        waiters.push(done);
                        return self.hangup_reason();
                    }
                    Some(SessionCommand::Yield) => return EndReason::CallCollision,
                    None => return self.hangup_reason(),
                },
                event = next_item(&mut self.record_watch) => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_record_event(event).await {
                            return reason;
                        }
                    }
                    None => self.record_watch = None,
                },
                candidate = next_item(&mut self.candidate_watch) => match candidate {
                    Some(candidate) => self.on_remote_candidate(candidate).await,
                    None => self.candidate_watch = None,
                },
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_peer_event(event).await {
                            return reason;
                        }
                    }
                    None => self.peer_events = None,
                },
                () = next_tick(&mut self.ticker) => self.on_tick(),
            }
        }
    }

    fn hangup_reason(&self) -> EndReason {
        if self.phase == CallPhase::Offered {
            EndReason::Rejected
        } else {
            EndReason::LocalHangup
        }
    }

    fn set_phase(&mut self, phase: CallPhase) {
        let old_state = self.phase;
        self.phase = phase;
        tracing::debug!(
            call_id = %self.call_id,
            role = %self.role,
            old_state = ?old_state,
            new_state = ?phase,
            "Call state transition"
        );
        self.reporter.update(|s| s.phase = phase);
        self.reporter.emit(CallEvent::PhaseChanged {
            call_id: self.call_id.clone(),
            phase,
        });
    }

    async fn start_caller(&mut self) -> Result<(), CallError> {
        self.set_phase(CallPhase::Initiating);
        self.acquire_media().await?;

        let pc = self.create_peer().await?;
        self.media.attach_peer(pc.clone()).await?;
        let offer = pc.create_offer().await?;
        pc.set_local_description(offer.clone()).await?;

        let payload = OfferPayload::new(offer.sdp, self.local_user.clone(), self.kind);
        self.owns_record = true;
        if let Err(e) = self.signaling.create_call(&self.call_id, payload).await {
            self.owns_record = false;
            return Err(e.into());
        }

        self.record_watch = Some(self.signaling.watch_record(&self.call_id).await?);
        self.candidate_watch = Some(
            self.signaling
                .watch_candidates(&self.call_id, NegotiationRole::Callee)
                .await?,
        );
        self.set_phase(CallPhase::AwaitingAnswer);
        tracing::info!(call_id = %self.call_id, peer = %self.peer_user, kind = %self.kind, "Call offered");
        Ok(())
    }

    async fn present_incoming(&mut self) -> Result<(), EndReason> {
        let mut watch = self
            .signaling
            .watch_record(&self.call_id)
            .await
            .map_err(|e| {
                tracing::warn!(call_id = %self.call_id, error = %e, "Cannot watch incoming call");
                EndReason::SignalingFailed
            })?;

        match watch.recv().await {
            Some(RecordEvent::Snapshot(record)) if record.answer.is_none() => {}
            _ => {
                tracing::debug!(call_id = %self.call_id, "Incoming call withdrawn before it was presented");
                self.owns_record = false;
                return Err(EndReason::NoLongerAvailable);
            }
        }

        self.record_watch = Some(watch);
        self.set_phase(CallPhase::Offered);
        self.reporter.emit(CallEvent::IncomingCall {
            call_id: self.call_id.clone(),
            caller: self.peer_user.clone(),
            kind: self.kind,
        });
        tracing::info!(call_id = %self.call_id, caller = %self.peer_user, kind = %self.kind, "Incoming call");
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let offer = self.offer.clone().ok_or(CallError::NoIncomingCall)?;
        self.acquire_media().await?;

        let pc = self.create_peer().await?;
        pc.set_remote_description(offer.description()).await?;
        self.flush_buffer(&pc).await;
        self.media.attach_peer(pc.clone()).await?;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.signaling
            .set_answer(&self.call_id, AnswerPayload::new(answer.sdp))
            .await?;

        self.candidate_watch = Some(
            self.signaling
                .watch_candidates(&self.call_id, NegotiationRole::Caller)
                .await?,
        );
        self.set_phase(CallPhase::Answered);
        tracing::info!(call_id = %self.call_id, "Call answered");
        Ok(())
    }

    async fn acquire_media(&mut self) -> Result<(), CallError> {
        let local = self
            .media
            .acquire_local_media(
                self.kind,
                self.config.default_facing_mode,
                self.config.audio_fallback_on_video_denied,
            )
            .await?;

        let flags = self.media.flags();
        self.reporter.update(|s| {
            s.flags = flags;
            s.video_denied = local.video_denied;
        });
        if local.video_denied {
            self.reporter.emit(CallEvent::MediaDegraded {
                call_id: self.call_id.clone(),
                reason: "Camera access denied, continuing with audio only".to_string(),
            });
        }
        Ok(())
    }

    async fn create_peer(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let pc = self.peers.create(&self.config.ice_servers, events).await?;
        self.pc = Some(pc.clone());
        self.peer_events = Some(receiver);
        Ok(pc)
    }

    async fn on_record_event(&mut self, event: RecordEvent) -> Option<EndReason> {
        match event {
            RecordEvent::Removed => {
                let reason = if self.phase == CallPhase::AwaitingAnswer {
                    EndReason::RejectedByPeer
                } else {
                    EndReason::EndedByPeer
                };
                tracing::info!(call_id = %self.call_id, phase = ?self.phase, "Call record removed by peer");
                Some(reason)
            }
            RecordEvent::Snapshot(record) => {
                if self.role != NegotiationRole::Caller || self.buffer.is_ready() {
                    return None;
                }
                let answer = record.answer?;
                let pc = self.pc.clone()?;
                tracing::debug!(call_id = %self.call_id, "Answer received");
                if let Err(e) = pc.set_remote_description(answer.description()).await {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Cannot apply answer");
                    return Some(EndReason::ConnectionFailed);
                }
                self.flush_buffer(&pc).await;
                if self.phase == CallPhase::AwaitingAnswer {
                    self.set_phase(CallPhase::Answered);
                }
                None
            }
        }
    }

    async fn flush_buffer(&mut self, pc: &Arc<dyn PeerConnection>) {
        let held = self.buffer.mark_ready();
        if !held.is_empty() {
            tracing::debug!(call_id = %self.call_id, count = held.len(), "Applying buffered candidates");
        }
        for candidate in held {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!(call_id = %self.call_id, error = %e, "Remote candidate rejected");
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(candidate) = self.buffer.accept(candidate) else {
            tracing::trace!(call_id = %self.call_id, pending = self.buffer.pending(), "Remote candidate buffered");
            return;
        };
        let Some(pc) = self.pc.clone() else {
            return;
        };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Remote candidate rejected");
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Option<EndReason> {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self
                    .signaling
                    .append_candidate(&self.call_id, self.role, candidate)
                    .await
                {
                    tracing::warn!(call_id = %self.call_id, error = %e, "Local candidate not published");
                }
                None
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::debug!(call_id = %self.call_id, state = ?state, "Peer connection state changed");
                match state {
                    PeerConnectionState::Connected => {
                        self.on_connected();
                        None
                    }
                    PeerConnectionState::Failed => Some(EndReason::ConnectionFailed),
                    PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                        Some(EndReason::Disconnected)
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => None,
                }
            }
            PeerEvent::Track(track) => {
                let track_id = track.id().to_string();
                if self.media.add_remote_track(track) {
                    tracing::debug!(call_id = %self.call_id, track_id = %track_id, "Remote track added");
                    self.reporter.emit(CallEvent::RemoteTrackAdded {
                        call_id: self.call_id.clone(),
                        track_id,
                    });
                }
                None
            }
        }
    }

    fn on_connected(&mut self) {
        if self.phase == CallPhase::Connected {
            return;
        }
        self.set_phase(CallPhase::Connected);

        let now = Instant::now();
        let period = Duration::from_millis(self.config.duration_tick_ms.max(1));
        let mut ticker = tokio::time::interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.connected_at = Some(now);
        self.duration_secs = 0;

        self.reporter.update(|s| s.duration_secs = 0);
        self.reporter.emit(CallEvent::Connected {
            call_id: self.call_id.clone(),
        });
        tracing::info!(call_id = %self.call_id, "Call connected");
    }

    fn on_tick(&mut self) {
        let Some(connected_at) = self.connected_at else {
            return;
        };
        let seconds = connected_at.elapsed().as_secs();
        if seconds == self.duration_secs {
            return;
        }
        self.duration_secs = seconds;
        self.reporter.update(|s| s.duration_secs = seconds);
        self.reporter.emit(CallEvent::DurationTick {
            call_id: self.call_id.clone(),
            seconds,
        });
    }

    /// Delete the call record in the background, bounded by the teardown timeout
    fn spawn_delete(&self) {
        let signaling = self.signaling.clone();
        let call_id = self.call_id.clone();
        let timeout = Duration::from_millis(self.config.teardown_timeout_ms);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, signaling.delete_call(&call_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Call record not deleted");
                }
                Err(_) => {
                    tracing::warn!(call_id = %call_id, "Call record delete timed out");
                }
            }
        });
    }

    /// Release everything the session holds
    ///
    /// Every step runs regardless of how the previous one went.
    async fn teardown(&mut self, reason: EndReason) {
        if let Some(mut watch) = self.record_watch.take() {
            watch.unsubscribe();
        }
        if let Some(mut watch) = self.candidate_watch.take() {
            watch.unsubscribe();
        }
        self.peer_events = None;
        self.ticker = None;

        let attached = self.media.detach_peer();
        if let Some(pc) = self.pc.take().or(attached) {
            if let Err(e) = pc.close().await {
                tracing::warn!(call_id = %self.call_id, error = %e, "Peer connection close failed");
            }
        }

        self.media.release_local_media();

        let remote_gone = reason.is_remote() || reason == EndReason::NoLongerAvailable;
        if self.owns_record && !remote_gone {
            self.spawn_delete();
        }

        tracing::info!(
            call_id = %self.call_id,
            role = %self.role,
            reason = ?reason,
            "Call session ended"
        );
    }
}
