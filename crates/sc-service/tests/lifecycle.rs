//! Coordinator startup and graceful shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::MediaKind;
use sc_service::actors::{SessionCoordinator, OUTBOUND_CHANNEL_CAPACITY};
use sc_service::config::Config;
use sc_service::egress::EgressState;
use sc_service::engine::{EngineError, MediaEngine};
use sc_service::errors::ScError;
use sc_service::observability::HealthState;
use sc_test_utils::{EngineOp, MockMediaEngine, MockTranscoder, TestHarness};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_ready_after_start() {
    let harness = TestHarness::start().await;

    assert!(harness.health.is_ready());
    assert!(!harness.health.is_engine_dead());
    assert_eq!(harness.coordinator.session_count(), 0);
}

#[tokio::test]
async fn test_sessions_are_counted() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let _bob = harness.connect();
    assert_eq!(harness.coordinator.session_count(), 2);
    assert_eq!(harness.coordinator.metrics().session_count(), 2);

    alice.disconnect().await;

    assert_eq!(harness.coordinator.session_count(), 1);
}

#[tokio::test]
async fn test_shutdown_releases_sessions_and_egress() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let bob = harness.connect();
    alice.open_send_transport().await;
    bob.open_recv_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;

    harness.coordinator.shutdown().await;

    assert!(!harness.health.is_ready());
    assert_eq!(harness.coordinator.session_count(), 0);
    assert!(alice.handle.is_cancelled());
    assert!(bob.handle.is_cancelled());

    let registries = harness.coordinator.registries();
    assert!(registries.transports().is_empty());
    assert_eq!(registries.broker().producer_count(), 0);
    assert_eq!(harness.engine.open_transports(), 0);
    assert_eq!(harness.transcoder.running(), 0);
    assert!(harness.coordinator.egress().status().await.is_err());

    let (tx, _rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let err = harness.coordinator.connect(tx).unwrap_err();
    assert!(matches!(err, ScError::EngineUnavailable), "got {err:?}");

    // Later handle calls see a closed session
    let err = alice.handle.rtp_capabilities().await.unwrap_err();
    assert!(matches!(err, ScError::SessionClosed), "got {err:?}");
}

#[tokio::test]
async fn test_start_fails_when_capabilities_are_unavailable() {
    let engine = Arc::new(MockMediaEngine::new());
    engine.fail_next(
        EngineOp::RtpCapabilities,
        EngineError::Unavailable("router not created".to_string()),
    );
    let config = Config::from_vars(&HashMap::from([(
        "SC_ID".to_string(),
        "sc-test".to_string(),
    )]))
    .unwrap();
    let health = Arc::new(HealthState::new());

    let result = SessionCoordinator::start(
        engine as Arc<dyn MediaEngine>,
        Arc::new(MockTranscoder::new()),
        &config,
        Arc::clone(&health),
    )
    .await;

    assert!(matches!(result, Err(ScError::EngineUnavailable)));
    assert!(!health.is_ready());
}
