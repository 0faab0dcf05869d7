//! Egress bridge lifecycle tests: the single output slot, standby
//! promotion, restart with backoff and abandonment.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use common::types::{MediaKind, ProducerId};
use sc_service::egress::{EgressState, EgressTransition, TranscoderEvent};
use sc_test_utils::{MockTranscoder, TestHarness};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::broadcast;

const TRANSITION_TIMEOUT: Duration = Duration::from_secs(3);

async fn next_transition(rx: &mut broadcast::Receiver<EgressTransition>) -> EgressTransition {
    tokio::time::timeout(TRANSITION_TIMEOUT, rx.recv())
        .await
        .expect("No egress transition arrived")
        .expect("Transition channel closed")
}

/// Collect transitions of `producer_id` until it reaches `state`.
async fn transitions_until(
    rx: &mut broadcast::Receiver<EgressTransition>,
    producer_id: &ProducerId,
    state: EgressState,
) -> Vec<(EgressState, u32)> {
    let mut seen = Vec::new();
    loop {
        let transition = next_transition(rx).await;
        if &transition.producer_id != producer_id {
            continue;
        }
        seen.push((transition.state, transition.failures));
        if transition.state == state {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_video_producer_reaches_running_and_writes_manifest() {
    let harness = TestHarness::start().await;
    let mut transitions = harness.coordinator.egress().subscribe();
    let alice = harness.connect();
    alice.handle.join_room("main").await.unwrap();
    alice.open_send_transport().await;

    let producer_id = alice.publish(MediaKind::Video).await;

    let seen = transitions_until(&mut transitions, &producer_id, EgressState::Running).await;
    assert_eq!(
        seen,
        vec![(EgressState::Starting, 0), (EgressState::Running, 0)]
    );
    assert!(harness.manifest_path().exists());

    let status = harness.egress_status().await;
    let active = status.active.unwrap();
    assert_eq!(active.producer_id, producer_id);
    assert_eq!(active.manifest_path, harness.manifest_path());
    assert!(status.standby.is_empty());
}

#[tokio::test]
async fn test_bridge_feeds_local_rtp_port() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;

    let connections = harness.engine.plain_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(connections[0].port, 5004);
    assert_eq!(connections[0].rtcp_port, Some(5005));

    let jobs = harness.transcoder.jobs();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].sdp.contains("m=video 5004 RTP/AVP 101"));
    assert_eq!(jobs[0].output_dir, harness.config.egress.output_dir);
}

#[tokio::test]
async fn test_audio_producer_has_no_egress() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.open_send_transport().await;

    alice.publish(MediaKind::Audio).await;

    let status = harness.egress_status().await;
    assert!(status.active.is_none());
    assert_eq!(harness.transcoder.spawn_count(), 0);
    assert_eq!(harness.engine.open_plain_transports(), 0);
}

#[tokio::test]
async fn test_bridge_consumer_stays_paused_until_transcoder_starts() {
    let harness = TestHarness::builder()
        .transcoder(MockTranscoder::new().without_auto_start())
        .build()
        .await;
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;

    harness
        .wait_until("transcoder spawn", || harness.transcoder.spawn_count() == 1)
        .await;
    let status = harness.egress_status().await;
    assert_eq!(status.active.unwrap().state, EgressState::Starting);
    let bridge_consumers = harness.engine.consumers_of(&producer_id);
    assert_eq!(bridge_consumers.len(), 1);
    assert_eq!(harness.engine.consumer_paused(&bridge_consumers[0]), Some(true));

    assert!(harness.transcoder.emit(TranscoderEvent::Started));

    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;
    assert_eq!(harness.engine.consumer_paused(&bridge_consumers[0]), Some(false));
}

#[tokio::test]
async fn test_repeated_activation_keeps_single_session() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;

    harness
        .coordinator
        .egress()
        .activate(producer_id.clone())
        .await
        .unwrap();

    let status = harness.egress_status().await;
    assert_eq!(status.active.unwrap().state, EgressState::Running);
    assert!(status.standby.is_empty());
    assert_eq!(harness.transcoder.spawn_count(), 1);
    assert_eq!(harness.transcoder.running(), 1);
}

#[tokio::test]
async fn test_disconnect_stops_running_egress() {
    let harness = TestHarness::start().await;
    let mut transitions = harness.coordinator.egress().subscribe();
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;

    alice.disconnect().await;

    let seen = transitions_until(&mut transitions, &producer_id, EgressState::Stopped).await;
    assert_eq!(seen.last(), Some(&(EgressState::Stopped, 0)));
    harness.wait_for_egress_idle().await;
    assert_eq!(harness.transcoder.stops(), 1);
    assert_eq!(harness.transcoder.running(), 0);
    assert_eq!(harness.engine.open_plain_transports(), 0);
}

#[tokio::test]
async fn test_second_video_waits_as_standby_and_is_promoted() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let bob = harness.connect();
    alice.open_send_transport().await;
    bob.open_send_transport().await;

    let first = alice.publish(MediaKind::Video).await;
    harness.wait_for_egress_state(&first, EgressState::Running).await;
    let second = bob.publish(MediaKind::Video).await;

    let status = harness.egress_status().await;
    assert_eq!(status.active.unwrap().producer_id, first);
    assert_eq!(status.standby, vec![second.clone()]);
    assert_eq!(harness.transcoder.spawn_count(), 1);

    alice.disconnect().await;

    harness.wait_for_egress_state(&second, EgressState::Running).await;
    assert!(harness.egress_status().await.standby.is_empty());
    assert_eq!(harness.transcoder.spawn_count(), 2);
    // The first transcoder was stopped before the second one started
    assert_eq!(harness.transcoder.stops(), 1);
    assert_eq!(harness.transcoder.running(), 1);
}

#[tokio::test]
async fn test_closing_standby_removes_it_from_queue() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    let bob = harness.connect();
    alice.open_send_transport().await;
    bob.open_send_transport().await;
    let first = alice.publish(MediaKind::Video).await;
    harness.wait_for_egress_state(&first, EgressState::Running).await;
    bob.publish(MediaKind::Video).await;

    bob.disconnect().await;

    let status = harness.egress_status().await;
    assert!(status.standby.is_empty());
    let active = status.active.unwrap();
    assert_eq!(active.producer_id, first);
    assert_eq!(active.state, EgressState::Running);
    assert_eq!(harness.transcoder.spawn_count(), 1);
}

#[tokio::test]
async fn test_transcoder_error_restarts_session() {
    let harness = TestHarness::start().await;
    let mut transitions = harness.coordinator.egress().subscribe();
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    transitions_until(&mut transitions, &producer_id, EgressState::Running).await;

    assert!(harness
        .transcoder
        .emit(TranscoderEvent::Error("encoder crashed".to_string())));

    let seen = transitions_until(&mut transitions, &producer_id, EgressState::Running).await;
    assert_eq!(
        seen,
        vec![
            (EgressState::Failed, 1),
            (EgressState::Starting, 1),
            (EgressState::Running, 0),
        ]
    );
    assert_eq!(harness.transcoder.spawn_count(), 2);
    assert_eq!(harness.transcoder.stops(), 1);
    assert_eq!(harness.engine.open_plain_transports(), 1);
}

#[tokio::test]
async fn test_unexpected_end_counts_as_failure() {
    let harness = TestHarness::start().await;
    let mut transitions = harness.coordinator.egress().subscribe();
    let alice = harness.connect();
    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Video).await;
    transitions_until(&mut transitions, &producer_id, EgressState::Running).await;

    assert!(harness.transcoder.emit(TranscoderEvent::Ended));

    let seen = transitions_until(&mut transitions, &producer_id, EgressState::Failed).await;
    assert_eq!(seen, vec![(EgressState::Failed, 1)]);
    harness
        .wait_for_egress_state(&producer_id, EgressState::Running)
        .await;
}

#[tokio::test]
async fn test_session_abandoned_after_max_attempts() {
    let transcoder = MockTranscoder::new();
    transcoder.fail_every_spawn("ffmpeg not found");
    let harness = TestHarness::builder()
        .transcoder(transcoder)
        .max_attempts(3)
        .build()
        .await;
    let mut transitions = harness.coordinator.egress().subscribe();
    let alice = harness.connect();
    alice.open_send_transport().await;

    let producer_id = alice.publish(MediaKind::Video).await;

    let seen = transitions_until(&mut transitions, &producer_id, EgressState::Abandoned).await;
    assert_eq!(
        seen,
        vec![
            (EgressState::Starting, 0),
            (EgressState::Failed, 1),
            (EgressState::Starting, 1),
            (EgressState::Failed, 2),
            (EgressState::Starting, 2),
            (EgressState::Failed, 3),
            (EgressState::Abandoned, 3),
        ]
    );
    harness.wait_for_egress_idle().await;
    assert_eq!(harness.transcoder.spawn_count(), 3);
    assert_eq!(harness.engine.open_plain_transports(), 0);

    // The producer itself is unaffected
    assert!(harness.engine.has_producer(&producer_id));
}

#[tokio::test]
async fn test_abandoned_session_promotes_standby() {
    let transcoder = MockTranscoder::new();
    for _ in 0..3 {
        transcoder.fail_next_spawn("bad input");
    }
    let harness = TestHarness::builder()
        .transcoder(transcoder)
        .max_attempts(3)
        .backoff(Duration::from_millis(100), Duration::from_millis(200))
        .build()
        .await;
    let alice = harness.connect();
    let bob = harness.connect();
    alice.open_send_transport().await;
    bob.open_send_transport().await;

    let first = alice.publish(MediaKind::Video).await;
    let second = bob.publish(MediaKind::Video).await;
    assert_eq!(harness.egress_status().await.standby, vec![second.clone()]);

    harness.wait_for_egress_state(&second, EgressState::Running).await;
    let status = harness.egress_status().await;
    assert!(!status.tracks(&first));
    assert_eq!(harness.transcoder.spawn_count(), 4);
}
