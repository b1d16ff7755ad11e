//! JSON element-counting append semantics and cold segment rotation.

use bytes::Bytes;
use tidelog::config::EngineConfig;
use tidelog::error::EngineError;
use tidelog::objectstore::InMemoryObjectStore;
use tidelog::queue::InMemoryQueue;
use tidelog::registry::InMemoryRegistry;
use tidelog::subscribers::InMemorySubscriberStore;
use tidelog::types::{AppendRequest, CreateRequest};
use tidelog::Broker;

type TestBroker = Broker<InMemoryObjectStore, InMemoryQueue, InMemorySubscriberStore, InMemoryRegistry>;

fn new_broker_with(config: EngineConfig) -> std::sync::Arc<TestBroker> {
    Broker::new(
        config,
        Some(std::sync::Arc::new(InMemoryObjectStore::new())),
        std::sync::Arc::new(InMemoryQueue::new()),
        std::sync::Arc::new(InMemorySubscriberStore::new()),
        std::sync::Arc::new(InMemoryRegistry::new()),
    )
}

fn new_broker() -> std::sync::Arc<TestBroker> {
    new_broker_with(EngineConfig::default())
}

#[tokio::test]
async fn a_json_array_counts_as_one_offset_position_per_element() {
    let broker = new_broker();
    let created = broker
        .create(
            "proj",
            "s",
            CreateRequest {
                content_type: Some("application/json".to_string()),
                initial_body: Some(Bytes::from_static(br#"[{"x":1},{"x":2}]"#)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.next_offset, tidelog::offset::Offset::new(0, 2).encode());

    let read = broker.read("proj", "s", &tidelog::offset::Offset::ZERO.encode()).await.unwrap();
    assert_eq!(read.body, Bytes::from_static(br#"[{"x":1},{"x":2}]"#));
}

#[tokio::test]
async fn a_single_json_object_counts_as_one_element() {
    let broker = new_broker();
    let created = broker
        .create(
            "proj",
            "s",
            CreateRequest {
                content_type: Some("application/json".to_string()),
                initial_body: Some(Bytes::from_static(br#"{"x":1}"#)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.next_offset, tidelog::offset::Offset::new(0, 1).encode());
}

#[tokio::test]
async fn an_empty_json_array_is_a_bad_request() {
    let broker = new_broker();
    broker
        .create(
            "proj",
            "s",
            CreateRequest {
                content_type: Some("application/json".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = broker
        .append(
            "proj",
            "s",
            AppendRequest {
                payload: Bytes::from_static(b"[]"),
                content_type: None,
                producer: None,
                stream_seq: None,
                close: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));
}

#[tokio::test]
async fn appends_past_the_rotation_threshold_still_read_back_in_full() {
    let config = EngineConfig {
        rotation_max_messages: 2,
        ..EngineConfig::default()
    };
    let broker = new_broker_with(config);
    broker
        .create(
            "proj",
            "s",
            CreateRequest {
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    for chunk in [&b"aa"[..], &b"bb"[..], &b"cc"[..]] {
        broker
            .append(
                "proj",
                "s",
                AppendRequest {
                    payload: Bytes::copy_from_slice(chunk),
                    content_type: None,
                    producer: None,
                    stream_seq: None,
                    close: false,
                },
            )
            .await
            .unwrap();
    }

    // Rotation folds early hot rows into a cold segment once
    // `rotation_max_messages` is exceeded; a catch-up reader pages across
    // the cold segment and the remaining hot rows one chunk at a time,
    // following each response's `next_offset` until caught up.
    let mut offset = tidelog::offset::Offset::ZERO.encode();
    let mut collected = Vec::new();
    loop {
        let read = broker.read("proj", "s", &offset).await.unwrap();
        collected.extend_from_slice(&read.body);
        offset = read.next_offset;
        if read.up_to_date {
            break;
        }
    }
    assert_eq!(collected, b"aabbcc");
}
