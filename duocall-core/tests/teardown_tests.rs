//! Resource release from every phase a call can end in

mod common;

use common::{eventually, user, Harness};
use duocall_core::{
    CallError, CallPhase, EndReason, MediaKind, PeerConnectionState,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn hangup_while_initiating() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    a.devices.hold_requests(true);

    let start = tokio::spawn({
        let manager = a.manager.clone();
        async move { manager.start_call(&user("B"), MediaKind::Video).await }
    });
    a.wait_for(CallPhase::Initiating).await;

    a.manager.end_call().await.unwrap();
    assert_eq!(start.await.unwrap(), Err(CallError::Cancelled));

    let ended = a.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::LocalHangup));

    a.devices.hold_requests(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.signaling.store.record_count(), 0);
    assert!(a.connections().is_empty());
    a.assert_released();
}

#[tokio::test]
async fn hangup_while_awaiting_answer() {
    let harness = Harness::new();
    let a = harness.party("A").await;

    let call_id = a.manager.start_call(&user("B"), MediaKind::Video).await.unwrap();
    assert_eq!(a.manager.snapshot().phase, CallPhase::AwaitingAnswer);
    assert_eq!(harness.signaling.store.watcher_count(), 3);

    a.manager.end_call().await.unwrap();
    assert_eq!(a.manager.snapshot().phase, CallPhase::Ended);
    assert_eq!(harness.signaling.store.watcher_count(), 1);
    eventually(|| !harness.signaling.store.contains(&call_id)).await;
    a.assert_released();
}

#[tokio::test]
async fn hangup_while_offered_declines() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    let call_id = a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;

    b.manager.end_call().await.unwrap();
    let ended = b.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::Rejected));
    let declined = a.wait_for(CallPhase::Ended).await;
    assert_eq!(declined.end_reason, Some(EndReason::RejectedByPeer));

    assert!(!harness.signaling.store.contains(&call_id));
    assert_eq!(harness.signaling.store.watcher_count(), 2);
    assert!(b.connections().is_empty());
    a.assert_released();
    b.assert_released();
}

#[tokio::test]
async fn hangup_while_answered() {
    let harness = Harness::new();
    harness.network.set_auto_connect(false);
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    let call_id = a.manager.start_call(&b.user, MediaKind::Video).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    b.manager.accept_incoming().await.unwrap();
    a.wait_for(CallPhase::Answered).await;
    assert_eq!(b.manager.snapshot().phase, CallPhase::Answered);

    b.manager.end_call().await.unwrap();
    let ended = a.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::EndedByPeer));
    assert!(!harness.signaling.store.contains(&call_id));
    a.assert_released();
    b.assert_released();
}

#[tokio::test]
async fn hangup_while_connected() {
    let harness = Harness::new();
    harness.network.set_auto_connect(false);
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    a.manager.start_call(&b.user, MediaKind::Video).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    b.manager.accept_incoming().await.unwrap();
    a.wait_for(CallPhase::Answered).await;

    a.connection().force_state(PeerConnectionState::Connected);
    b.connection().force_state(PeerConnectionState::Connected);
    a.wait_for(CallPhase::Connected).await;
    b.wait_for(CallPhase::Connected).await;

    a.manager.end_call().await.unwrap();
    b.wait_for(CallPhase::Ended).await;
    assert_eq!(harness.signaling.store.record_count(), 0);
    assert_eq!(harness.signaling.store.watcher_count(), 2);
    a.assert_released();
    b.assert_released();
}

#[tokio::test]
async fn connection_loss_ends_both_sides() {
    let harness = Harness::new();
    harness.network.set_auto_connect(false);
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    b.manager.accept_incoming().await.unwrap();
    a.wait_for(CallPhase::Answered).await;
    b.connection().force_state(PeerConnectionState::Connected);
    b.wait_for(CallPhase::Connected).await;

    b.connection().force_state(PeerConnectionState::Disconnected);
    let lost = b.wait_for(CallPhase::Ended).await;
    assert_eq!(lost.end_reason, Some(EndReason::Disconnected));
    let ended = a.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::EndedByPeer));
    a.assert_released();
    b.assert_released();
}

#[tokio::test]
async fn connection_failure_ends_call() {
    let harness = Harness::new();
    harness.network.set_auto_connect(false);
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    b.manager.accept_incoming().await.unwrap();
    a.wait_for(CallPhase::Answered).await;

    a.connection().force_state(PeerConnectionState::Failed);
    let failed = a.wait_for(CallPhase::Ended).await;
    assert_eq!(failed.end_reason, Some(EndReason::ConnectionFailed));
    b.wait_for(CallPhase::Ended).await;
    a.assert_released();
    b.assert_released();
}

#[tokio::test]
async fn hangup_survives_signaling_outage() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    let call_id = a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    b.manager.accept_incoming().await.unwrap();
    a.wait_for(CallPhase::Connected).await;

    harness.signaling.store.fail_writes(Some("offline"));
    a.manager.end_call().await.unwrap();

    let ended = a.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::LocalHangup));
    a.assert_released();
    eventually(|| harness.signaling.deletes().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(harness.signaling.store.contains(&call_id));
    b.wait_for(CallPhase::Connected).await;

    harness.signaling.store.fail_writes(None);
    b.manager.end_call().await.unwrap();
    eventually(|| !harness.signaling.store.contains(&call_id)).await;
}

#[tokio::test]
async fn failed_offer_write_aborts_call() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    harness.signaling.store.fail_writes(Some("offline"));

    let result = a.manager.start_call(&user("B"), MediaKind::Video).await;
    assert!(matches!(result, Err(CallError::SignalingWriteFailed(_))));

    let ended = a.wait_for(CallPhase::Ended).await;
    assert_eq!(ended.end_reason, Some(EndReason::SignalingFailed));
    assert_eq!(harness.signaling.store.record_count(), 0);
    assert!(harness.signaling.deletes().is_empty());
    assert_eq!(a.connections().len(), 1);
    a.assert_released();
}

#[tokio::test(start_paused = true)]
async fn stalled_delete_does_not_block_hangup() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    let b = harness.party("B").await;
    let call_id = a.manager.start_call(&user("C"), MediaKind::Voice).await.unwrap();

    harness.signaling.stall_deletes(true);
    let started = tokio::time::Instant::now();
    a.manager.end_call().await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(a.manager.snapshot().phase, CallPhase::Ended);
    a.assert_released();
    eventually(|| harness.signaling.deletes() == vec![call_id.clone()]).await;

    // The slot is free while the delete is still pending
    harness.signaling.stall_deletes(false);
    a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;
    assert!(harness.signaling.store.contains(&call_id));

    // The stalled delete gives up after the teardown timeout
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(harness.signaling.store.contains(&call_id));
}

#[tokio::test]
async fn shutdown_ends_active_call() {
    let harness = Harness::new();
    let a = harness.party("A").await;
    let b = harness.party("B").await;

    let call_id = a.manager.start_call(&b.user, MediaKind::Voice).await.unwrap();
    b.wait_for(CallPhase::Offered).await;

    a.manager.shutdown().await;
    eventually(|| !harness.signaling.store.contains(&call_id)).await;
    b.wait_for(CallPhase::Ended).await;
    eventually(|| harness.signaling.store.watcher_count() == 1).await;
    a.assert_released();
}
