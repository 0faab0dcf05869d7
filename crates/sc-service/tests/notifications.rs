//! Producer notification scope tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use common::types::{MediaKind, RoomId};
use sc_service::config::NotificationScope;
use sc_test_utils::TestHarness;
use signaling_protocol::Notification;
use std::time::Duration;

/// Let in-flight fan-out settle before asserting that nothing arrived.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_all_scope_notifies_everyone_but_owner() {
    let harness = TestHarness::start().await;
    let mut alice = harness.connect();
    let mut bob = harness.connect();
    let mut carol = harness.connect();
    bob.handle.join_room("other").await.unwrap();

    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;
    let expected = Notification::NewProducer { producer_id };

    assert_eq!(bob.next_notification().await, expected);
    assert_eq!(carol.next_notification().await, expected);
    settle().await;
    assert!(alice.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_room_scope_limits_to_owner_room() {
    let harness = TestHarness::builder()
        .scope(NotificationScope::Room)
        .build()
        .await;
    let alice = harness.connect();
    let mut bob = harness.connect();
    let mut carol = harness.connect();
    alice.handle.join_room("stage").await.unwrap();
    bob.handle.join_room("stage").await.unwrap();
    carol.handle.join_room("lobby").await.unwrap();

    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;

    assert_eq!(
        bob.next_notification().await,
        Notification::NewProducer { producer_id }
    );
    settle().await;
    assert!(carol.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_room_scope_owner_without_room_notifies_nobody() {
    let harness = TestHarness::builder()
        .scope(NotificationScope::Room)
        .build()
        .await;
    let alice = harness.connect();
    let mut bob = harness.connect();
    bob.handle.join_room("stage").await.unwrap();

    alice.open_send_transport().await;
    alice.publish(MediaKind::Audio).await;

    settle().await;
    assert!(bob.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_joining_another_room_moves_the_session() {
    let harness = TestHarness::builder()
        .scope(NotificationScope::Room)
        .build()
        .await;
    let alice = harness.connect();
    let mut bob = harness.connect();
    let mut carol = harness.connect();
    alice.handle.join_room("stage").await.unwrap();
    bob.handle.join_room("stage").await.unwrap();
    carol.handle.join_room("lobby").await.unwrap();

    alice.handle.join_room("lobby").await.unwrap();

    let rooms = harness.coordinator.registries().rooms();
    assert_eq!(rooms.room_of(alice.id()), Some(RoomId::from("lobby")));
    assert_eq!(rooms.member_count(&RoomId::from("stage")), 1);
    assert_eq!(rooms.member_count(&RoomId::from("lobby")), 2);

    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;

    assert_eq!(
        carol.next_notification().await,
        Notification::NewProducer { producer_id }
    );
    settle().await;
    assert!(bob.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.handle.join_room("stage").await.unwrap();
    let rooms = harness.coordinator.registries().rooms();
    assert_eq!(rooms.member_count(&RoomId::from("stage")), 1);

    alice.disconnect().await;

    assert_eq!(rooms.room_of(alice.id()), None);
    assert_eq!(rooms.member_count(&RoomId::from("stage")), 0);
    // Rooms outlive their members
    assert!(rooms.contains_room(&RoomId::from("stage")));
}

#[tokio::test]
async fn test_producer_closed_follows_room_scope() {
    let harness = TestHarness::builder()
        .scope(NotificationScope::Room)
        .build()
        .await;
    let alice = harness.connect();
    let mut bob = harness.connect();
    let mut carol = harness.connect();
    alice.handle.join_room("stage").await.unwrap();
    bob.handle.join_room("stage").await.unwrap();
    carol.handle.join_room("lobby").await.unwrap();

    alice.open_send_transport().await;
    let producer_id = alice.publish(MediaKind::Audio).await;
    assert!(matches!(
        bob.next_notification().await,
        Notification::NewProducer { .. }
    ));

    alice.disconnect().await;

    assert_eq!(
        bob.next_notification().await,
        Notification::ProducerClosed { producer_id }
    );
    settle().await;
    assert!(carol.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_late_joiner_is_not_told_about_existing_producers() {
    let harness = TestHarness::start().await;
    let alice = harness.connect();
    alice.open_send_transport().await;
    alice.publish(MediaKind::Audio).await;

    let mut bob = harness.connect();

    settle().await;
    assert!(bob.drain_notifications().is_empty());
}
