//! Transport-agnostic request/response types.
//!
//! The HTTP front door is an external collaborator: it translates its own
//! headers/body into these structs and back. Nothing in `engine`, `read`,
//! `delivery`, or `fanout` knows about HTTP.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// `(id, epoch, seq)` used for write idempotency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerTriple {
    pub id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Mutually-exclusive expiry policy for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    TtlSeconds(u64),
    ExpiresAt(DateTime<Utc>),
}

/// Request for `create_or_idempotent`.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub content_type: Option<String>,
    pub initial_body: Option<Bytes>,
    pub producer: Option<ProducerTriple>,
    pub close: bool,
    pub public: bool,
    pub expiry: Option<Expiry>,
    pub stream_seq: Option<String>,
}

/// Outcome of `create_or_idempotent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub created: bool,
    pub next_offset: String,
}

/// Request for `append`.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub producer: Option<ProducerTriple>,
    pub stream_seq: Option<String>,
    pub close: bool,
}

/// Outcome of `append`. `status` is 200 with a producer triple, 204
/// without one or on duplicate replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub status: u16,
    pub next_offset: String,
    pub closed: bool,
}

/// Result of a read operation.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub body: Bytes,
    pub next_offset: String,
    pub up_to_date: bool,
    pub closed_at_tail: bool,
    pub write_timestamp: Option<i64>,
    pub etag: String,
    pub content_type: Option<String>,
    pub cache_control: String,
}

/// Result of `head`.
#[derive(Debug, Clone)]
pub struct HeadOutcome {
    pub content_type: Option<String>,
    pub next_offset: String,
    pub closed: bool,
    pub ttl_seconds_remaining: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Inputs the engine hands to the fanout pipeline after a non-empty append
/// commits. The engine itself never dispatches fanout; it only calls
/// back into whatever [`crate::fanout`] hook the owning broker registered.
#[derive(Debug, Clone)]
pub struct FanoutTrigger {
    pub project_id: String,
    pub source_stream_id: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub subscribers: Vec<String>,
    pub fanout_seq: u64,
}

/// Stream lifecycle event published to registered hooks/watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Created { stream_id: String, content_type: Option<String>, timestamp_ms: i64 },
    Closed { stream_id: String, timestamp_ms: i64 },
    Deleted { stream_id: String, timestamp_ms: i64 },
}
