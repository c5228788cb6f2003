//! Remote event fanout tests: best-effort HTTP delivery with bounded retry
//! that never fails the publisher.

use std::sync::Arc;
use uuid::Uuid;

use foreman::services::{EventBus, EventBusConfig, EventPayload, RemoteSinkConfig, RetryPolicy};

fn bus_for(endpoint: String) -> Arc<EventBus> {
    Arc::new(EventBus::new(EventBusConfig {
        channel_capacity: 64,
        persist_events: false,
        remote: Some(RemoteSinkConfig {
            endpoint,
            retry: RetryPolicy::new(2, 10, 50),
            queue_capacity: 64,
        }),
    }))
}

#[tokio::test]
async fn events_are_posted_to_the_remote_sink() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/events")
        .match_header("content-type", "application/json")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let bus = bus_for(format!("{}/events", server.url()));
    let _drive = bus.drive().await;

    bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;

    // The drain task delivers asynchronously.
    for _ in 0..50 {
        if mock.matched_async().await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn transient_remote_failures_are_retried() {
    let mut server = mockito::Server::new_async().await;
    // Always failing endpoint: the policy (2 retries) yields 3 attempts.
    let failing = server
        .mock("POST", "/events")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let bus = bus_for(format!("{}/events", server.url()));
    let _drive = bus.drive().await;

    bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;

    for _ in 0..100 {
        if failing.matched_async().await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    failing.assert_async().await;
}

#[tokio::test]
async fn unreachable_remote_never_fails_the_publisher() {
    // Nothing listens on this port; every delivery attempt fails.
    let bus = bus_for("http://127.0.0.1:1/events".to_string());
    let _drive = bus.drive().await;

    // publish() itself must stay infallible and keep assigning sequences.
    let first = bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
    let second = bus.publish(EventPayload::TaskCancelled { task_id: Uuid::new_v4() }).await;
    assert_eq!(first.sequence.0, 0);
    assert_eq!(second.sequence.0, 1);
}
