//! In-memory signaling store
//!
//! Process-local [`SignalingChannel`] with the same observable contract as a
//! shared document database: per-field writes, snapshot on subscribe and
//! candidate backlog replay. Clones share one store, so two call managers in
//! the same process can signal each other through it.

use crate::identity::UserId;
use crate::signaling::{RecordEvent, SignalingChannel, SignalingError, Subscription};
use crate::types::{AnswerPayload, CallId, CallRecord, IceCandidate, NegotiationRole, OfferPayload};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct Watcher<T> {
    id: u64,
    sender: mpsc::UnboundedSender<T>,
}

struct IncomingWatcher {
    id: u64,
    user: UserId,
    sender: mpsc::UnboundedSender<CallRecord>,
}

struct StoredRecord {
    record: CallRecord,
    offer_candidates: Vec<IceCandidate>,
    answer_candidates: Vec<IceCandidate>,
}

impl StoredRecord {
    fn candidates(&self, role: NegotiationRole) -> &[IceCandidate] {
        match role {
            NegotiationRole::Caller => &self.offer_candidates,
            NegotiationRole::Callee => &self.answer_candidates,
        }
    }

    fn candidates_mut(&mut self, role: NegotiationRole) -> &mut Vec<IceCandidate> {
        match role {
            NegotiationRole::Caller => &mut self.offer_candidates,
            NegotiationRole::Callee => &mut self.answer_candidates,
        }
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<CallId, StoredRecord>,
    record_watchers: HashMap<CallId, Vec<Watcher<RecordEvent>>>,
    candidate_watchers: HashMap<(CallId, NegotiationRole), Vec<Watcher<IceCandidate>>>,
    incoming_watchers: Vec<IncomingWatcher>,
    next_watcher_id: u64,
    write_failure: Option<String>,
}

impl StoreInner {
    fn next_id(&mut self) -> u64 {
        self.next_watcher_id += 1;
        self.next_watcher_id
    }

    fn check_writable(&self) -> Result<(), SignalingError> {
        match &self.write_failure {
            Some(reason) => Err(SignalingError::WriteFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn notify_record(&mut self, call_id: &CallId, event: &RecordEvent) {
        if let Some(watchers) = self.record_watchers.get_mut(call_id) {
            watchers.retain(|w| w.sender.send(event.clone()).is_ok());
        }
    }
}

/// In-memory signaling store
#[derive(Clone, Default)]
pub struct MemorySignalingStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemorySignalingStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `reason` until called with `None`
    pub fn fail_writes(&self, reason: Option<&str>) {
        self.inner.lock().write_failure = reason.map(str::to_string);
    }

    /// Current record, if present
    pub fn record(&self, call_id: &CallId) -> Option<CallRecord> {
        self.inner
            .lock()
            .records
            .get(call_id)
            .map(|r| r.record.clone())
    }

    /// Whether a record is present
    pub fn contains(&self, call_id: &CallId) -> bool {
        self.inner.lock().records.contains_key(call_id)
    }

    /// Candidates written by `role`, in arrival order
    pub fn candidates(&self, call_id: &CallId, role: NegotiationRole) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .records
            .get(call_id)
            .map(|r| r.candidates(role).to_vec())
            .unwrap_or_default()
    }

    /// Number of records present
    pub fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Number of live watches of any kind
    pub fn watcher_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.record_watchers.values().map(Vec::len).sum::<usize>()
            + inner.candidate_watchers.values().map(Vec::len).sum::<usize>()
            + inner.incoming_watchers.len()
    }

    fn weak(&self) -> Weak<Mutex<StoreInner>> {
        Arc::downgrade(&self.inner)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignalingStore {
    async fn create_call(
        &self,
        call_id: &CallId,
        offer: OfferPayload,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if inner.records.contains_key(call_id) {
            return Err(SignalingError::AlreadyExists(call_id.clone()));
        }

        let record = CallRecord::offered(call_id.clone(), offer);
        inner.records.insert(
            call_id.clone(),
            StoredRecord {
                record: record.clone(),
                offer_candidates: Vec::new(),
                answer_candidates: Vec::new(),
            },
        );
        inner.notify_record(call_id, &RecordEvent::Snapshot(record.clone()));
        inner.incoming_watchers.retain(|w| {
            !record.is_ringing_for(&w.user) || w.sender.send(record.clone()).is_ok()
        });
        tracing::trace!(call_id = %call_id, "Record created");
        Ok(())
    }

    async fn set_answer(
        &self,
        call_id: &CallId,
        answer: AnswerPayload,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        let stored = inner
            .records
            .get_mut(call_id)
            .filter(|r| r.record.offer.is_some())
            .ok_or_else(|| SignalingError::NotFound(call_id.clone()))?;
        if stored.record.answer.is_some() {
            return Err(SignalingError::AlreadyExists(call_id.clone()));
        }
        stored.record.answer = Some(answer);
        let snapshot = RecordEvent::Snapshot(stored.record.clone());
        inner.notify_record(call_id, &snapshot);
        tracing::trace!(call_id = %call_id, "Answer stored");
        Ok(())
    }

    async fn append_candidate(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        let stored = inner
            .records
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::NotFound(call_id.clone()))?;
        stored.candidates_mut(role).push(candidate.clone());
        if let Some(watchers) = inner.candidate_watchers.get_mut(&(call_id.clone(), role)) {
            watchers.retain(|w| w.sender.send(candidate.clone()).is_ok());
        }
        Ok(())
    }

    async fn watch_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordEvent>, SignalingError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let initial = match inner.records.get(call_id) {
            Some(stored) => RecordEvent::Snapshot(stored.record.clone()),
            None => RecordEvent::Removed,
        };
        let _ = sender.send(initial);

        let id = inner.next_id();
        inner
            .record_watchers
            .entry(call_id.clone())
            .or_default()
            .push(Watcher { id, sender });
        drop(inner);

        let weak = self.weak();
        let key = call_id.clone();
        Ok(Subscription::new(receiver, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                if let Some(watchers) = inner.record_watchers.get_mut(&key) {
                    watchers.retain(|w| w.id != id);
                    if watchers.is_empty() {
                        inner.record_watchers.remove(&key);
                    }
                }
            }
        }))
    }

    async fn watch_candidates(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.records.get(call_id) {
            for candidate in stored.candidates(role) {
                let _ = sender.send(candidate.clone());
            }
        }

        let id = inner.next_id();
        let key = (call_id.clone(), role);
        inner
            .candidate_watchers
            .entry(key.clone())
            .or_default()
            .push(Watcher { id, sender });
        drop(inner);

        let weak = self.weak();
        Ok(Subscription::new(receiver, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                if let Some(watchers) = inner.candidate_watchers.get_mut(&key) {
                    watchers.retain(|w| w.id != id);
                    if watchers.is_empty() {
                        inner.candidate_watchers.remove(&key);
                    }
                }
            }
        }))
    }

    async fn delete_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        if inner.records.remove(call_id).is_some() {
            inner.notify_record(call_id, &RecordEvent::Removed);
            // Watches end with the record; dropping the senders closes them
            inner.record_watchers.remove(call_id);
            for role in [NegotiationRole::Caller, NegotiationRole::Callee] {
                inner.candidate_watchers.remove(&(call_id.clone(), role));
            }
            tracing::trace!(call_id = %call_id, "Record deleted");
        }
        Ok(())
    }

    async fn watch_incoming_calls(
        &self,
        user: &UserId,
    ) -> Result<Subscription<CallRecord>, SignalingError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let mut ringing: Vec<CallRecord> = inner
            .records
            .values()
            .map(|r| &r.record)
            .filter(|r| r.is_ringing_for(user))
            .cloned()
            .collect();
        ringing.sort_by_key(|r| r.call_id.to_string());
        for record in ringing {
            let _ = sender.send(record);
        }

        let id = inner.next_id();
        inner.incoming_watchers.push(IncomingWatcher {
            id,
            user: user.clone(),
            sender,
        });
        drop(inner);

        let weak = self.weak();
        Ok(Subscription::new(receiver, move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().incoming_watchers.retain(|w| w.id != id);
            }
        }))
    }
}
