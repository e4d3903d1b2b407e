//! Integration tests for the change feed
//!
//! These tests require a running Redis instance.
//! Run with: cargo test --test integration_test -- --ignored

use change_feed::{ChangeAction, ChangeEvent, ChangePublisher, ChangeSubscriber, ChangeTable};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

fn unique_channel() -> String {
    format!("community:changes:test:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Requires Redis server
async fn test_publish_and_receive_via_callback() {
    let channel = unique_channel();
    let publisher =
        ChangePublisher::with_channel(REDIS_URL, "test-service".to_string(), channel.clone())
            .await
            .expect("Failed to create publisher");
    let subscriber = ChangeSubscriber::with_channel(REDIS_URL, channel)
        .await
        .expect("Failed to create subscriber");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);

    let handle = subscriber
        .subscribe(move |event| {
            let received = Arc::clone(&received_clone);
            async move {
                received.lock().await.push(event);
                Ok(())
            }
        })
        .await
        .expect("Failed to subscribe");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let post_id = Uuid::new_v4();
    let subscribers = publisher
        .publish(ChangeEvent::insert(ChangeTable::Posts, post_id, "test-service"))
        .await
        .expect("Failed to publish");
    assert!(subscribers > 0, "No subscribers received the event");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = received.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].table, ChangeTable::Posts);
    assert_eq!(events[0].action, ChangeAction::Insert);
    assert_eq!(events[0].record_id, Some(post_id));
    assert_eq!(events[0].source, "test-service");

    subscriber.unsubscribe(handle);
}

#[tokio::test]
#[ignore] // Requires Redis server
async fn test_stream_yields_events_in_publish_order() {
    let channel = unique_channel();
    let publisher =
        ChangePublisher::with_channel(REDIS_URL, "test-service".to_string(), channel.clone())
            .await
            .expect("Failed to create publisher");
    let subscriber = ChangeSubscriber::with_channel(REDIS_URL, channel)
        .await
        .expect("Failed to create subscriber");

    let mut stream = subscriber.stream().await.expect("Failed to open stream");

    let conversation_id = Uuid::new_v4();
    publisher
        .publish(
            ChangeEvent::insert(ChangeTable::Messages, Uuid::new_v4(), "test-service")
                .with_scope(conversation_id.to_string()),
        )
        .await
        .unwrap();
    publisher
        .publish(ChangeEvent::update(
            ChangeTable::Conversations,
            conversation_id,
            "test-service",
        ))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("decode failed");
    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("decode failed");

    assert_eq!(first.table, ChangeTable::Messages);
    assert!(first.in_scope(&conversation_id.to_string()));
    assert_eq!(second.table, ChangeTable::Conversations);
    assert_eq!(subscriber.stats().events_received, 2);
    assert_eq!(publisher.stats().events_published, 2);
}
