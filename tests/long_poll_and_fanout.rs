//! Live delivery and cross-stream fanout: a long-poll resolving once an
//! append lands, and an append fanning out into an estuary stream.

use std::time::Duration;

use bytes::Bytes;
use tidelog::config::EngineConfig;
use tidelog::objectstore::InMemoryObjectStore;
use tidelog::queue::InMemoryQueue;
use tidelog::registry::InMemoryRegistry;
use tidelog::subscribers::InMemorySubscriberStore;
use tidelog::types::{AppendRequest, CreateRequest};
use tidelog::Broker;

type TestBroker = Broker<InMemoryObjectStore, InMemoryQueue, InMemorySubscriberStore, InMemoryRegistry>;

fn new_broker() -> std::sync::Arc<TestBroker> {
    Broker::new(
        EngineConfig::default(),
        Some(std::sync::Arc::new(InMemoryObjectStore::new())),
        std::sync::Arc::new(InMemoryQueue::new()),
        std::sync::Arc::new(InMemorySubscriberStore::new()),
        std::sync::Arc::new(InMemoryRegistry::new()),
    )
}

#[tokio::test]
async fn long_poll_resolves_once_a_pending_append_lands() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    let waiter_broker = broker.clone();
    let waiter = tokio::spawn(async move {
        waiter_broker
            .wait_for_tail("proj", "s", &tidelog::offset::Offset::ZERO.encode(), None, 2_000)
            .await
            .unwrap()
    });

    // Give the waiter a moment to register before the append lands.
    tokio::time::sleep(Duration::from_millis(20)).await;

    broker
        .append(
            "proj",
            "s",
            AppendRequest {
                payload: Bytes::from_static(b"hi"),
                content_type: None,
                producer: None,
                stream_seq: None,
                close: false,
            },
        )
        .await
        .unwrap();

    let outcome = waiter.await.unwrap();
    assert_eq!(outcome.body, Bytes::from_static(b"hi"));
    assert!(outcome.up_to_date);
}

#[tokio::test]
async fn long_poll_times_out_with_no_new_data() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    let outcome = broker
        .wait_for_tail("proj", "s", &tidelog::offset::Offset::ZERO.encode(), None, 100)
        .await
        .unwrap();
    assert!(outcome.body.is_empty());
    assert!(outcome.up_to_date);
}

#[tokio::test]
async fn appends_fan_out_inline_into_a_subscribed_estuary_stream() {
    let broker = new_broker();
    broker
        .create(
            "proj",
            "source",
            CreateRequest {
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    broker
        .create(
            "proj",
            "estuary",
            CreateRequest {
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    broker.add_subscriber("proj", "source", "proj/estuary").await.unwrap();

    broker
        .append(
            "proj",
            "source",
            AppendRequest {
                payload: Bytes::from_static(b"event"),
                content_type: None,
                producer: None,
                stream_seq: None,
                close: false,
            },
        )
        .await
        .unwrap();

    // Inline fanout is dispatched from a spawned task; poll briefly for it
    // to land rather than asserting immediately after the source append.
    let mut seen = Bytes::new();
    for _ in 0..50 {
        let read = broker
            .read("proj", "estuary", &tidelog::offset::Offset::ZERO.encode())
            .await
            .unwrap();
        if !read.body.is_empty() {
            seen = read.body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen, Bytes::from_static(b"event"));
}
