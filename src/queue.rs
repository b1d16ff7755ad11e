//! Durable queue collaborator: any FIFO with at-least-once delivery, acks,
//! and retry. Carries fanout batches to the queued consumer side of
//! [`crate::fanout`].

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Wire schema for a fanout batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub project_id: String,
    pub source_stream_id: String,
    pub estuary_ids: Vec<String>,
    pub payload_base64: String,
    pub content_type: Option<String>,
    pub producer_headers: Option<ProducerHeaders>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerHeaders {
    pub producer_id: String,
    pub producer_epoch: u64,
    pub producer_seq: u64,
}

impl FanoutMessage {
    pub fn encode_payload(payload: &[u8]) -> String {
        STANDARD.encode(payload)
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.payload_base64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// A handle to one dequeued message; acking or nacking consumes it, mirroring
/// at-least-once queues where redelivery happens until the consumer acks.
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, message: FanoutMessage) -> Result<(), QueueError>;
    async fn dequeue(&self) -> Option<(FanoutMessage, u64)>;
    async fn ack(&self, handle: u64) -> Result<(), QueueError>;
    async fn nack(&self, handle: u64) -> Result<(), QueueError>;
}

/// In-memory FIFO test double; `nack` puts the message back at the tail so a
/// retried batch gets redelivered rather than lost.
pub struct InMemoryQueue {
    inner: tokio::sync::Mutex<InMemoryQueueState>,
}

struct InMemoryQueueState {
    next_handle: u64,
    pending: std::collections::VecDeque<(u64, FanoutMessage)>,
    in_flight: std::collections::HashMap<u64, FanoutMessage>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(InMemoryQueueState {
                next_handle: 0,
                pending: std::collections::VecDeque::new(),
                in_flight: std::collections::HashMap::new(),
            }),
        }
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableQueue for InMemoryQueue {
    async fn enqueue(&self, message: FanoutMessage) -> Result<(), QueueError> {
        let mut state = self.inner.lock().await;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.pending.push_back((handle, message));
        Ok(())
    }

    async fn dequeue(&self) -> Option<(FanoutMessage, u64)> {
        let mut state = self.inner.lock().await;
        let (handle, message) = state.pending.pop_front()?;
        state.in_flight.insert(handle, message.clone());
        Some((message, handle))
    }

    async fn ack(&self, handle: u64) -> Result<(), QueueError> {
        self.inner.lock().await.in_flight.remove(&handle);
        Ok(())
    }

    async fn nack(&self, handle: u64) -> Result<(), QueueError> {
        let mut state = self.inner.lock().await;
        if let Some(message) = state.in_flight.remove(&handle) {
            state.pending.push_back((handle, message));
        }
        Ok(())
    }
}
