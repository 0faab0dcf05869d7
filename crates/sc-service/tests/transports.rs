//! Transport lifecycle tests: one handle per (session, direction),
//! connect ordering, double connect and out-of-band closes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{Direction, MediaKind};
use sc_service::errors::ScError;
use sc_service::registry::TransportState;
use sc_test_utils::{dtls_parameters, EngineOp, TestHarness};
use signaling_protocol::Notification;

#[tokio::test]
async fn test_second_create_for_same_direction_conflicts() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    let first = alice.handle.create_transport(Direction::Send).await.unwrap();
    let second = alice.handle.create_transport(Direction::Send).await;

    let err = second.unwrap_err();
    assert!(matches!(err, ScError::Conflict(_)), "got {err:?}");
    assert_eq!(err.error_code(), 5);

    // Existing handle untouched, engine asked only once
    let transports = harness.coordinator.registries().transports();
    assert_eq!(
        transports.transport_id(alice.id(), Direction::Send),
        Some(first.id)
    );
    assert_eq!(
        transports.state(alice.id(), Direction::Send),
        Some(TransportState::Created)
    );
    assert_eq!(harness.engine.calls(EngineOp::CreateWebRtcTransport), 1);
}

#[tokio::test]
async fn test_send_and_recv_are_independent() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    let send = alice.handle.create_transport(Direction::Send).await.unwrap();
    let recv = alice.handle.create_transport(Direction::Recv).await.unwrap();

    assert_ne!(send.id, recv.id);
    assert_eq!(harness.coordinator.registries().transports().len(), 2);
}

#[tokio::test]
async fn test_transport_params_are_relayed_verbatim() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    let params = alice.handle.create_transport(Direction::Send).await.unwrap();

    assert!(harness.engine.has_transport(&params.id));
    assert_eq!(params.dtls_parameters.0["role"], "auto");
    assert!(params.ice_candidates.0.is_array());
    assert!(params.ice_parameters.0["usernameFragment"].is_string());
}

#[tokio::test]
async fn test_connect_before_create_is_not_found() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    for direction in Direction::ALL {
        let err = alice
            .handle
            .connect_transport(direction, dtls_parameters())
            .await
            .unwrap_err();
        assert!(matches!(err, ScError::NotFound(_)), "got {err:?}");
        assert_eq!(err.error_code(), 4);
    }
    assert_eq!(harness.engine.calls(EngineOp::ConnectWebRtcTransport), 0);
}

#[tokio::test]
async fn test_connect_transitions_to_connected() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    let params = alice.handle.create_transport(Direction::Recv).await.unwrap();
    alice
        .handle
        .connect_transport(Direction::Recv, dtls_parameters())
        .await
        .unwrap();

    assert_eq!(
        harness
            .coordinator
            .registries()
            .transports()
            .state(alice.id(), Direction::Recv),
        Some(TransportState::Connected)
    );
    assert!(harness.engine.is_connected(&params.id));
}

#[tokio::test]
async fn test_double_connect_conflicts_without_engine_call() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.open_send_transport().await;

    let err = alice
        .handle
        .connect_transport(Direction::Send, dtls_parameters())
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::Conflict(_)), "got {err:?}");
    assert_eq!(err.client_message(), "Transport already connected");
    assert_eq!(harness.engine.calls(EngineOp::ConnectWebRtcTransport), 1);
}

#[tokio::test]
async fn test_failed_connect_leaves_handle_created() {
    let harness = TestHarness::start().await;
    harness.engine.fail_next(
        EngineOp::ConnectWebRtcTransport,
        sc_service::engine::EngineError::Rejected("bad fingerprint".to_string()),
    );
    let alice = harness.connect();
    alice.handle.create_transport(Direction::Send).await.unwrap();

    let err = alice
        .handle
        .connect_transport(Direction::Send, dtls_parameters())
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::Engine(_)), "got {err:?}");
    assert_eq!(err.error_code(), 2);
    assert_eq!(
        harness
            .coordinator
            .registries()
            .transports()
            .state(alice.id(), Direction::Send),
        Some(TransportState::Created)
    );

    // The client may retry with better parameters
    alice
        .handle
        .connect_transport(Direction::Send, dtls_parameters())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_creates_are_serialized() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();

    let (a, b) = tokio::join!(
        alice.handle.create_transport(Direction::Send),
        alice.handle.create_transport(Direction::Send),
    );

    let results = [a, b];
    let created = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(ScError::Conflict(_))))
        .count();
    assert_eq!((created, conflicts), (1, 1));
    assert_eq!(harness.engine.calls(EngineOp::CreateWebRtcTransport), 1);
    assert_eq!(harness.engine.open_webrtc_transports(), 1);
}

#[tokio::test]
async fn test_out_of_band_close_releases_handle_and_consumers() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();
    let bob = harness.connect();

    let recv = alice.open_recv_transport().await;
    bob.open_send_transport().await;
    let producer_id = bob.publish(MediaKind::Audio).await;
    let consumer = alice.subscribe(&producer_id).await;
    assert!(matches!(
        alice.next_notification().await,
        Notification::NewProducer { .. }
    ));

    harness.engine.close_transport_out_of_band(&recv.id);

    assert_eq!(
        alice.next_notification().await,
        Notification::ConsumerClosed {
            consumer_id: consumer.id.clone()
        }
    );
    let registries = harness.coordinator.registries();
    assert_eq!(registries.transports().state(alice.id(), Direction::Recv), None);
    assert!(registries.broker().consumers_of(alice.id()).is_empty());

    // A fresh receive transport can be negotiated
    alice.open_recv_transport().await;
}

#[tokio::test]
async fn test_out_of_band_close_of_send_transport_closes_producers() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let mut bob = harness.connect();

    let send = alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;
    assert_eq!(
        bob.next_notification().await,
        Notification::NewProducer {
            producer_id: producer_id.clone()
        }
    );

    harness.engine.close_transport_out_of_band(&send.id);

    assert_eq!(
        bob.next_notification().await,
        Notification::ProducerClosed {
            producer_id: producer_id.clone()
        }
    );
    let registries = harness.coordinator.registries();
    assert_eq!(registries.broker().producer_owner(&producer_id), None);
    assert_eq!(registries.transports().state(alice.id(), Direction::Send), None);
}

#[tokio::test]
async fn test_failed_send_transport_is_closed_in_engine() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let mut bob = harness.connect();

    let send = alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;
    assert!(matches!(
        bob.next_notification().await,
        Notification::NewProducer { .. }
    ));

    // The engine only reports the failure; releasing is up to us
    harness.engine.report_dtls_failure(&send.id);

    assert_eq!(
        bob.next_notification().await,
        Notification::ProducerClosed {
            producer_id: producer_id.clone()
        }
    );
    harness
        .wait_until("failed transport closed", || {
            !harness.engine.has_transport(&send.id)
        })
        .await;
    assert!(!harness.engine.has_producer(&producer_id));
    assert_eq!(
        harness
            .coordinator
            .registries()
            .transports()
            .state(alice.id(), Direction::Send),
        None
    );

    alice.disconnect().await;

    assert_eq!(harness.engine.open_transports(), 0);
    assert_eq!(harness.engine.open_producers(), 0);
}

#[tokio::test]
async fn test_failed_recv_transport_closes_its_consumers_in_engine() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();
    let bob = harness.connect();

    let recv = alice.open_recv_transport().await;
    bob.open_send_transport().await;
    let producer_id = bob.publish(MediaKind::Audio).await;
    let consumer = alice.subscribe(&producer_id).await;
    assert!(matches!(
        alice.next_notification().await,
        Notification::NewProducer { .. }
    ));

    harness.engine.report_dtls_failure(&recv.id);

    assert_eq!(
        alice.next_notification().await,
        Notification::ConsumerClosed {
            consumer_id: consumer.id.clone()
        }
    );
    harness
        .wait_until("failed transport closed", || {
            !harness.engine.has_transport(&recv.id)
        })
        .await;
    assert_eq!(harness.engine.consumer_paused(&consumer.id), None);
    assert_eq!(harness.engine.open_consumers(), 0);
    // The source producer belongs to someone else and stays up
    assert!(harness.engine.has_producer(&producer_id));

    alice.disconnect().await;

    assert_eq!(harness.engine.open_webrtc_transports(), 1);
}
