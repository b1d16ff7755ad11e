//! Producer triple enforcement across `append` calls: dedup, stale epoch,
//! and sequence gaps.

use bytes::Bytes;
use tidelog::config::EngineConfig;
use tidelog::error::EngineError;
use tidelog::objectstore::InMemoryObjectStore;
use tidelog::queue::InMemoryQueue;
use tidelog::registry::InMemoryRegistry;
use tidelog::subscribers::InMemorySubscriberStore;
use tidelog::types::{AppendRequest, CreateRequest, ProducerTriple};
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

fn append_with(
    payload: &'static [u8],
    producer_id: &str,
    epoch: u64,
    seq: u64,
    close: bool,
) -> AppendRequest {
    AppendRequest {
        payload: Bytes::from_static(payload),
        content_type: None,
        producer: Some(ProducerTriple {
            id: producer_id.to_string(),
            epoch,
            seq,
        }),
        stream_seq: None,
        close,
    }
}

#[tokio::test]
async fn first_write_must_start_at_seq_zero() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    let err = broker
        .append("proj", "s", append_with(b"x", "p1", 0, 1, false))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));
}

#[tokio::test]
async fn duplicate_seq_replays_without_rewriting() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    let first = broker
        .append("proj", "s", append_with(b"abc", "p1", 0, 0, false))
        .await
        .unwrap();
    assert_eq!(first.status, 200);

    let replay = broker
        .append("proj", "s", append_with(b"abc", "p1", 0, 0, false))
        .await
        .unwrap();
    assert_eq!(replay.status, 200);
    assert_eq!(replay.next_offset, first.next_offset);

    // Confirm the replay did not append a second copy of the body.
    let read = broker.read("proj", "s", &tidelog::offset::Offset::ZERO.encode()).await.unwrap();
    assert_eq!(read.body, Bytes::from_static(b"abc"));
}

#[tokio::test]
async fn seq_gap_is_rejected() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    broker
        .append("proj", "s", append_with(b"a", "p1", 0, 0, false))
        .await
        .unwrap();

    let err = broker
        .append("proj", "s", append_with(b"b", "p1", 0, 5, false))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::SeqGap {
            expected: 1,
            received: 5
        }
    );
}

#[tokio::test]
async fn stale_epoch_is_rejected() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    broker
        .append("proj", "s", append_with(b"a", "p1", 2, 0, false))
        .await
        .unwrap();

    let err = broker
        .append("proj", "s", append_with(b"b", "p1", 1, 0, false))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::StaleEpoch { current_epoch: 2 });
}

#[tokio::test]
async fn higher_epoch_restarts_sequencing_at_zero() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    broker
        .append("proj", "s", append_with(b"a", "p1", 0, 0, false))
        .await
        .unwrap();
    broker
        .append("proj", "s", append_with(b"b", "p1", 0, 1, false))
        .await
        .unwrap();

    // Epoch bump: seq must restart at 0, not continue from 2.
    let err = broker
        .append("proj", "s", append_with(b"c", "p1", 1, 2, false))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest { .. }));

    let ok = broker
        .append("proj", "s", append_with(b"c", "p1", 1, 0, false))
        .await
        .unwrap();
    assert_eq!(ok.status, 200);
}

#[tokio::test]
async fn distinct_producers_sequence_independently() {
    let broker = new_broker();
    broker.create("proj", "s", CreateRequest::default()).await.unwrap();

    broker
        .append("proj", "s", append_with(b"a", "p1", 0, 0, false))
        .await
        .unwrap();
    // p2 has never written; its own sequence starts fresh at 0 regardless
    // of what p1 has done.
    let ok = broker
        .append("proj", "s", append_with(b"b", "p2", 0, 0, false))
        .await
        .unwrap();
    assert_eq!(ok.status, 200);
}
