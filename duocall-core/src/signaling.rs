//! Signaling channel
//!
//! Offer, answer and ICE candidates travel through a shared document store
//! before the direct media path exists. [`SignalingChannel`] abstracts that
//! store into per-field writes and snapshot-on-subscribe watches, so the
//! negotiation logic never depends on a particular backend.

use crate::identity::UserId;
use crate::types::{AnswerPayload, CallId, CallRecord, IceCandidate, NegotiationRole, OfferPayload};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// A record with an offer already exists for this call
    #[error("Call record already exists: {0}")]
    AlreadyExists(CallId),

    /// No record, or no offer, for this call
    #[error("Call record not found: {0}")]
    NotFound(CallId),

    /// The backing store rejected the write
    #[error("Signaling write failed: {0}")]
    WriteFailed(String),

    /// The channel is shut down
    #[error("Signaling channel closed")]
    Closed,
}

/// Change notification for one call record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    /// Full current record
    Snapshot(CallRecord),
    /// The record was deleted, or never existed
    Removed,
}

/// Live watch on the signaling store
///
/// Delivers items until unsubscribed or dropped. Dropping a subscription
/// unsubscribes it.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver; `cancel` runs once on unsubscribe
    pub fn new(receiver: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next item, or `None` once the watch has ended
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next item if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stop the watch; safe to call more than once
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.receiver.close();
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has run
    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_none()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

/// Shared document store used for call signaling
///
/// Implement this for your backing store (document database, key-value
/// store with change feeds, etc.). Writes are per field: the offer, the
/// answer and each candidate are written independently so the two
/// participants never overwrite each other.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Write a new record holding `offer`
    ///
    /// Fails with [`SignalingError::AlreadyExists`] if a record with an offer
    /// is already present (both sides dialed at once; first writer wins).
    async fn create_call(&self, call_id: &CallId, offer: OfferPayload)
        -> Result<(), SignalingError>;

    /// Write the answer field
    ///
    /// Fails with [`SignalingError::NotFound`] if there is no record or no offer.
    async fn set_answer(&self, call_id: &CallId, answer: AnswerPayload)
        -> Result<(), SignalingError>;

    /// Append a candidate to the sub-collection written by `role`
    ///
    /// Fails with [`SignalingError::NotFound`] if the record was deleted.
    async fn append_candidate(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// Watch a record
    ///
    /// The current state is delivered immediately ([`RecordEvent::Removed`]
    /// if the record does not exist), then every later mutation.
    async fn watch_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordEvent>, SignalingError>;

    /// Watch the candidates written by `role`
    ///
    /// Each candidate is delivered exactly once in arrival order, including
    /// those written before the subscription.
    async fn watch_candidates(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
    ) -> Result<Subscription<IceCandidate>, SignalingError>;

    /// Delete a record and its candidates; deleting a missing record succeeds
    async fn delete_call(&self, call_id: &CallId) -> Result<(), SignalingError>;

    /// Watch for unanswered records whose callee is `user`
    async fn watch_incoming_calls(
        &self,
        user: &UserId,
    ) -> Result<Subscription<CallRecord>, SignalingError>;
}

/// Signaling handler
///
/// Wraps a [`SignalingChannel`] with tracing and failure accounting, and
/// applies the "orphaned candidate" policy: a candidate whose record has
/// already been deleted is dropped with a log line instead of an error.
pub struct SignalingHandler<C: SignalingChannel> {
    channel: Arc<C>,
    failure_count: AtomicU32,
}

impl<C: SignalingChannel> SignalingHandler<C> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            failure_count: AtomicU32::new(0),
        }
    }

    fn record_result<T>(&self, operation: &'static str, result: &Result<T, SignalingError>) {
        match result {
            Ok(_) => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            Err(SignalingError::WriteFailed(reason)) => {
                let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(operation, failures = count, %reason, "Signaling write failed");
            }
            Err(e) => {
                tracing::debug!(operation, error = %e, "Signaling operation rejected");
            }
        }
    }

    /// Write the offer record
    ///
    /// # Errors
    ///
    /// Returns error if the record exists or the write fails
    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id))]
    pub async fn create_call(
        &self,
        call_id: &CallId,
        offer: OfferPayload,
    ) -> Result<(), SignalingError> {
        tracing::debug!(kind = %offer.media_kind, "Writing offer");
        let result = self.channel.create_call(call_id, offer).await;
        self.record_result("create_call", &result);
        result
    }

    /// Write the answer
    ///
    /// # Errors
    ///
    /// Returns error if the record is gone or the write fails
    #[tracing::instrument(skip(self, answer), fields(call_id = %call_id))]
    pub async fn set_answer(
        &self,
        call_id: &CallId,
        answer: AnswerPayload,
    ) -> Result<(), SignalingError> {
        tracing::debug!("Writing answer");
        let result = self.channel.set_answer(call_id, answer).await;
        self.record_result("set_answer", &result);
        result
    }

    /// Publish a local candidate
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; a deleted record is not an error
    #[tracing::instrument(skip(self, candidate), fields(call_id = %call_id, role = %role))]
    pub async fn append_candidate(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let result = self.channel.append_candidate(call_id, role, candidate).await;
        self.record_result("append_candidate", &result);
        match result {
            Err(SignalingError::NotFound(_)) => {
                tracing::debug!("Record deleted, candidate orphaned");
                Ok(())
            }
            other => other,
        }
    }

    /// Watch a record
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be watched
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn watch_record(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<RecordEvent>, SignalingError> {
        self.channel.watch_record(call_id).await
    }

    /// Watch the candidates written by `role`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be watched
    #[tracing::instrument(skip(self), fields(call_id = %call_id, role = %role))]
    pub async fn watch_candidates(
        &self,
        call_id: &CallId,
        role: NegotiationRole,
    ) -> Result<Subscription<IceCandidate>, SignalingError> {
        self.channel.watch_candidates(call_id, role).await
    }

    /// Delete a record
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn delete_call(&self, call_id: &CallId) -> Result<(), SignalingError> {
        tracing::debug!("Deleting call record");
        let result = self.channel.delete_call(call_id).await;
        self.record_result("delete_call", &result);
        result
    }

    /// Watch incoming calls for `user`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be watched
    #[tracing::instrument(skip(self), fields(user = %user))]
    pub async fn watch_incoming_calls(
        &self,
        user: &UserId,
    ) -> Result<Subscription<CallRecord>, SignalingError> {
        self.channel.watch_incoming_calls(user).await
    }

    /// Consecutive failed writes
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Get access to the underlying channel
    #[must_use]
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemorySignalingStore;
    use crate::types::MediaKind;
    use futures::StreamExt;
    use std::sync::atomic::AtomicBool;

    fn ids() -> (UserId, UserId, CallId) {
        let a = UserId::new("A").unwrap();
        let b = UserId::new("B").unwrap();
        let call_id = CallId::for_pair(&a, &b);
        (a, b, call_id)
    }

    #[test]
    fn test_subscription_unsubscribes_once() {
        let (_tx, rx) = mpsc::unbounded_channel::<u32>();
        let cancelled = Arc::new(AtomicU32::new(0));
        let mut sub = Subscription::new(rx, {
            let cancelled = cancelled.clone();
            move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }
        });

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_drop_cancels() {
        let (_tx, rx) = mpsc::unbounded_channel::<u32>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let sub = Subscription::new(rx, {
            let cancelled = cancelled.clone();
            move || cancelled.store(true, Ordering::SeqCst)
        });
        drop(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_subscription_is_a_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Subscription::new(rx, || {});
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);
        let items: Vec<u32> = sub.collect().await;
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_handler_drops_orphaned_candidate() {
        let store = Arc::new(MemorySignalingStore::new());
        let handler = SignalingHandler::new(store.clone());
        let (_, _, call_id) = ids();

        let result = handler
            .append_candidate(&call_id, NegotiationRole::Caller, IceCandidate::new("c1"))
            .await;
        assert!(result.is_ok());
        assert!(store.candidates(&call_id, NegotiationRole::Caller).is_empty());
    }

    #[tokio::test]
    async fn test_handler_counts_write_failures() {
        let store = Arc::new(MemorySignalingStore::new());
        let handler = SignalingHandler::new(store.clone());
        let (a, _, call_id) = ids();

        store.fail_writes(Some("offline"));
        let offer = OfferPayload::new("v=0", a.clone(), MediaKind::Voice);
        assert!(matches!(
            handler.create_call(&call_id, offer.clone()).await,
            Err(SignalingError::WriteFailed(_))
        ));
        assert!(handler.delete_call(&call_id).await.is_err());
        assert_eq!(handler.failure_count(), 2);

        store.fail_writes(None);
        handler.create_call(&call_id, offer).await.unwrap();
        assert_eq!(handler.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_access_channel() {
        let store = Arc::new(MemorySignalingStore::new());
        let handler = SignalingHandler::new(store.clone());
        assert!(Arc::ptr_eq(handler.channel(), &store));
    }
}
