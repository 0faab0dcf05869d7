//! Signaling frame handling: callback responses, fire-and-forget events,
//! undecodable frames and request metrics.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use sc_service::signaling::handle_text;
use sc_test_utils::{TestClient, TestHarness};
use serde_json::{json, Value};
use signaling_protocol::{encode_frame, ResponsePayload, ServerFrame};
use std::time::Duration;

async fn send(client: &TestClient, frame: Value) {
    assert!(handle_text(&client.handle, &frame.to_string()).await);
}

/// Next response frame, as the JSON the client would read.
async fn next_response(client: &mut TestClient) -> (u64, ResponsePayload, Value) {
    let frame = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.outbound.recv().await {
                Some(frame @ ServerFrame::Response { .. }) => return frame,
                Some(ServerFrame::Notification(_)) => {}
                None => panic!("Outbound channel closed"),
            }
        }
    })
    .await
    .expect("No response arrived");

    let wire: Value = serde_json::from_str(&encode_frame(&frame).unwrap()).unwrap();
    match frame {
        ServerFrame::Response { id, data } => (id, data, wire),
        ServerFrame::Notification(_) => unreachable!(),
    }
}

#[tokio::test]
async fn test_create_transport_is_answered_through_callback() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();

    send(
        &alice,
        json!({"id": 7, "event": "create-webrtc-transport", "data": {"direction": "send"}}),
    )
    .await;

    let (id, data, wire) = next_response(&mut alice).await;
    assert_eq!(id, 7);
    let ResponsePayload::Transport { params } = data else {
        panic!("expected transport params, got {data:?}");
    };
    assert!(harness.engine.has_transport(&params.id));
    assert_eq!(wire["type"], "response");
    assert_eq!(wire["data"]["params"]["id"], params.id.as_str());
    assert!(wire["data"]["params"]["dtlsParameters"].is_object());
    assert!(wire["data"]["params"]["iceCandidates"].is_array());
}

#[tokio::test]
async fn test_failed_request_is_answered_with_error() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();

    send(
        &alice,
        json!({
            "id": 1,
            "event": "connect-transport",
            "data": {"direction": "recv", "dtlsParameters": {"role": "client", "fingerprints": []}}
        }),
    )
    .await;

    let (id, data, wire) = next_response(&mut alice).await;
    assert_eq!(id, 1);
    assert!(data.is_error());
    assert_eq!(wire["data"]["error"], "No recv transport exists");
}

#[tokio::test]
async fn test_join_room_has_no_response() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();

    send(&alice, json!({"event": "join-room", "data": {"roomId": "stage"}})).await;
    send(&alice, json!({"id": 2, "event": "get-router-rtp-capabilities"})).await;

    // Requests run in order, so the capabilities answer is the first frame
    let (id, data, _) = next_response(&mut alice).await;
    assert_eq!(id, 2);
    assert!(matches!(data, ResponsePayload::RtpCapabilities(_)));
    assert!(alice.drain_frames().is_empty());
    assert_eq!(
        harness
            .coordinator
            .registries()
            .rooms()
            .room_of(alice.id())
            .map(|room| room.as_str().to_string()),
        Some("stage".to_string())
    );
}

#[tokio::test]
async fn test_request_without_callback_id_is_ignored() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();

    send(
        &alice,
        json!({"event": "create-webrtc-transport", "data": {"direction": "send"}}),
    )
    .await;
    send(&alice, json!({"id": 3, "event": "get-router-rtp-capabilities"})).await;

    let (id, _, _) = next_response(&mut alice).await;
    assert_eq!(id, 3);
    assert!(harness.coordinator.registries().transports().is_empty());
}

#[tokio::test]
async fn test_undecodable_frames() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();

    // Not JSON at all: nothing to answer
    assert!(handle_text(&alice.handle, "not json").await);
    // Unknown event with a callback id: answered with an error
    send(&alice, json!({"id": 4, "event": "close-everything"})).await;

    let (id, data, _) = next_response(&mut alice).await;
    assert_eq!(id, 4);
    assert!(data.is_error());
    assert!(alice.drain_frames().is_empty());
}

#[tokio::test]
async fn test_frames_for_closed_session_stop_the_reader() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.disconnect().await;

    let frame = json!({"id": 5, "event": "get-router-rtp-capabilities"});
    assert!(!handle_text(&alice.handle, &frame.to_string()).await);
}

#[tokio::test]
async fn test_requests_are_counted_by_event_and_status() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    let harness = TestHarness::start().await;
    let mut alice = harness.connect();
    send(
        &alice,
        json!({"id": 1, "event": "consume", "data": {"producerId": "missing", "rtpCapabilities": {}}}),
    )
    .await;
    next_response(&mut alice).await;

    let snapshot = snapshotter.snapshot().into_vec();
    let counted = snapshot.iter().any(|(key, _, _, value)| {
        let key = key.key();
        key.name() == "sc_signaling_requests_total"
            && key.labels().any(|l| l.key() == "event" && l.value() == "consume")
            && key
                .labels()
                .any(|l| l.key() == "status" && l.value() == "incompatible")
            && matches!(value, DebugValue::Counter(1))
    });
    assert!(counted, "consume request was not counted as incompatible");
}
