//! Media engine fault tests: bounded calls, late results, sessions that
//! disappear mid-call and worker death.
//!
//! Audio only: these run on paused time, and video would start egress
//! pipelines that touch the filesystem.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{Direction, MediaKind};
use sc_service::actors::OUTBOUND_CHANNEL_CAPACITY;
use sc_service::errors::ScError;
use sc_test_utils::{rtp_parameters, EngineOp, TestHarness};
use std::time::Duration;
use tokio::sync::mpsc;

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

async fn harness() -> TestHarness {
    TestHarness::builder().call_timeout(CALL_TIMEOUT).build().await
}

#[tokio::test(start_paused = true)]
async fn test_hung_engine_call_times_out_and_session_survives() {
    let harness = harness().await;
    harness.engine.hang(EngineOp::CreateWebRtcTransport);
    let alice = harness.connect();

    let err = alice
        .handle
        .create_transport(Direction::Send)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            ScError::EngineTimeout {
                operation: "create_webrtc_transport"
            }
        ),
        "got {err:?}"
    );
    assert_eq!(err.error_code(), 6);
    assert_eq!(
        harness
            .coordinator
            .registries()
            .transports()
            .state(alice.id(), Direction::Send),
        None
    );

    // The session keeps serving requests
    harness.engine.respond_normally(EngineOp::CreateWebRtcTransport);
    alice.open_send_transport().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_transport_is_reaped() {
    let harness = harness().await;
    harness
        .engine
        .delay(EngineOp::CreateWebRtcTransport, CALL_TIMEOUT * 5);
    let alice = harness.connect();

    let err = alice
        .handle
        .create_transport(Direction::Recv)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::EngineTimeout { .. }), "got {err:?}");

    tokio::time::sleep(CALL_TIMEOUT * 10).await;

    assert_eq!(harness.engine.open_transports(), 0);
    assert_eq!(harness.engine.closed_transports().len(), 1);
    assert!(harness.coordinator.registries().transports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_producer_is_reaped_without_notification() {
    let harness = harness().await;
    let alice = harness.connect();
    let mut bob = harness.connect();
    alice.open_send_transport().await;
    harness.engine.delay(EngineOp::Produce, CALL_TIMEOUT * 5);

    let err = alice
        .handle
        .produce(MediaKind::Audio, rtp_parameters(MediaKind::Audio))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ScError::EngineTimeout { operation: "produce" }),
        "got {err:?}"
    );

    tokio::time::sleep(CALL_TIMEOUT * 10).await;

    assert_eq!(harness.engine.open_producers(), 0);
    assert_eq!(harness.engine.closed_producers().len(), 1);
    assert_eq!(harness.coordinator.registries().broker().producer_count(), 0);
    assert!(bob.drain_notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_engine_call_leaves_nothing_behind() {
    let harness = harness().await;
    harness
        .engine
        .delay(EngineOp::CreateWebRtcTransport, Duration::from_millis(500));
    let alice = harness.connect();

    let handle = alice.handle.clone();
    let in_flight = tokio::spawn(async move { handle.create_transport(Direction::Send).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.engine.calls(EngineOp::CreateWebRtcTransport), 1);

    alice.disconnect().await;

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(ScError::SessionClosed)), "got {result:?}");
    assert_eq!(harness.engine.open_transports(), 0);
    assert!(harness.coordinator.registries().transports().is_empty());
    assert_eq!(harness.coordinator.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_death_stops_accepting_sessions() {
    let harness = harness().await;
    let alice = harness.connect();
    let bob = harness.connect();
    alice.open_send_transport().await;
    bob.open_recv_transport().await;
    assert!(harness.health.is_ready());

    harness.engine.kill_worker("worker exited with signal 9");

    let reason = tokio::time::timeout(Duration::from_secs(5), harness.coordinator.worker_died())
        .await
        .expect("worker death was not reported");
    assert_eq!(reason, "worker exited with signal 9");
    assert!(harness.health.is_engine_dead());
    assert!(!harness.health.is_ready());
    assert_eq!(harness.coordinator.session_count(), 0);
    assert!(alice.handle.is_cancelled());
    assert!(bob.handle.is_cancelled());

    let (tx, _rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let err = harness.coordinator.connect(tx).unwrap_err();
    assert!(matches!(err, ScError::EngineUnavailable), "got {err:?}");

    let registries = harness.coordinator.registries();
    harness
        .wait_until("session records released", || registries.transports().is_empty())
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_engine_unavailable_maps_to_unavailable_code() {
    let harness = harness().await;
    let alice = harness.connect();
    harness.engine.fail_next(
        EngineOp::CreateWebRtcTransport,
        sc_service::engine::EngineError::Unavailable("router closed".to_string()),
    );

    let err = alice
        .handle
        .create_transport(Direction::Send)
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::EngineUnavailable), "got {err:?}");
    assert_eq!(err.error_code(), 6);
}
