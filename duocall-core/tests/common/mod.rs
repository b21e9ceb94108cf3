//! Shared fixtures for call flow tests
#![allow(dead_code)]

use async_trait::async_trait;
use duocall_core::signaling::{RecordEvent, SignalingChannel, SignalingError, Subscription};
use duocall_core::sim::{SimMediaDevices, SimNetwork, SimPeerConnection};
use duocall_core::{
    AnswerPayload, CallEvent, CallId, CallManager, CallManagerConfig, CallPhase, CallRecord,
    CallSnapshot, IceCandidate, MemorySignalingStore, MediaTrack, NegotiationRole, OfferPayload,
    TrackState, UserId,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// Memory store that records deletes and can stall them
#[derive(Clone, Default)]
pub struct RecordingSignaling {
    pub store: MemorySignalingStore,
    deletes: Arc<Mutex<Vec<CallId>>>,
    stall_deletes: Arc<AtomicBool>,
}

impl RecordingSignaling {
    pub fn deletes(&self) -> Vec<CallId> {
        self.deletes.lock().clone()
    }

    pub fn stall_deletes(&self, stall: bool) {
        self.stall_deletes.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn create_call(
        &self,
        call_id: &CallId,
        offer: OfferPayload,
    ) -> Result<(), SignalingError> {
        self.store.create_call(call_id, offer).await
    }

    async fn set_answer(
        &self,
        call_id: &CallId,
        answer: AnswerPayload,
    ) -> Result<(), SignalingError> {
        self.store.set_answer(call_id, answer).await
    }

    async fn append_candidate(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.store.append_candidate(call_id, role, candidate).await
    }

    async fn watch_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordEvent>, SignalingError> {
        self.store.watch_record(call_id).await
    }

    async fn watch_candidates(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        self.store.watch_candidates(call_id, role).await
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.deletes.lock().push(call_id.clone());
        if self.stall_deletes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.store.delete_call(call_id).await
    }

    async fn watch_incoming_calls(
        &self,
        user: &UserId,
    ) -> Result<Subscription<CallRecord>, SignalingError> {
        self.store.watch_incoming_calls(user).await
    }
}

pub fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

/// Configuration producing the bare pair id
pub fn shared_ids() -> CallManagerConfig {
    CallManagerConfig {
        unique_attempt_ids: false,
        ..CallManagerConfig::default()
    }
}

/// One signaling store and one simulated network shared by all parties
#[derive(Clone, Default)]
pub struct Harness {
    pub signaling: RecordingSignaling,
    pub network: SimNetwork,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn party(&self, name: &str) -> Party {
        self.party_with(name, CallManagerConfig::default()).await
    }

    pub async fn party_with(&self, name: &str, config: CallManagerConfig) -> Party {
        let devices = SimMediaDevices::new();
        let manager = CallManager::builder(user(name), Arc::new(self.signaling.clone()))
            .with_media_devices(Arc::new(devices.clone()))
            .with_peer_factory(Arc::new(self.network.factory(name)))
            .with_config(config)
            .build()
            .unwrap();
        manager.start().await.unwrap();
        Party {
            name: name.to_string(),
            user: user(name),
            manager,
            devices,
            network: self.network.clone(),
        }
    }
}

pub struct Party {
    pub name: String,
    pub user: UserId,
    pub manager: CallManager<RecordingSignaling>,
    pub devices: SimMediaDevices,
    network: SimNetwork,
}

impl Party {
    pub async fn wait_for(&self, phase: CallPhase) -> CallSnapshot {
        wait_for_phase(&self.manager, phase).await
    }

    pub fn connections(&self) -> Vec<Arc<SimPeerConnection>> {
        self.network.connections_for(&self.name)
    }

    pub fn connection(&self) -> Arc<SimPeerConnection> {
        self.connections().pop().unwrap()
    }

    /// Every captured track stopped and every connection closed
    pub fn assert_released(&self) {
        for track in self.devices.issued_tracks() {
            assert_eq!(
                track.ready_state(),
                TrackState::Ended,
                "{} left track {} running",
                self.name,
                track.id()
            );
        }
        for connection in self.connections() {
            assert!(connection.is_closed(), "{} left a connection open", self.name);
        }
        assert!(self.manager.local_stream().is_none());
    }
}

pub async fn wait_for_phase(
    manager: &CallManager<RecordingSignaling>,
    phase: CallPhase,
) -> CallSnapshot {
    let mut state = manager.subscribe_state();
    let snapshot = tokio::time::timeout(WAIT, state.wait_for(|s| s.phase == phase))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {phase:?}"))
        .unwrap()
        .clone();
    snapshot
}

/// Wait until `condition` holds, yielding to other tasks in between
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Next event matching `matches`
pub async fn next_event(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}
