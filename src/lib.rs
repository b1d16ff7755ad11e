//! Tidelog: a durable, append-only stream broker core.
//!
//! A stream is identified by an opaque `project_id/stream_id` path. Writers
//! append messages (or close the stream) under an optional producer
//! `(id, epoch, seq)` triple for exactly-once-per-epoch write semantics;
//! readers either page history from an offset or subscribe live. Messages
//! land in an in-process hot row store and roll into immutable cold segments
//! in an object store once a stream's hot region grows past its rotation
//! threshold. A stream can additionally fan its appends out into subscriber
//! "estuary" streams, dispatched inline for a handful of subscribers or
//! queued through a durable FIFO for many.
//!
//! [`Broker`] is the crate's single entry point: it owns one
//! [`engine::StreamEngine`] per stream, lazily opened on first touch, and
//! wires together the storage-facing and transport-facing collaborators
//! (object store, durable queue, subscriber store, registry) that the engine
//! itself never needs to know about.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tidelog::config::EngineConfig;
//! use tidelog::objectstore::InMemoryObjectStore;
//! use tidelog::queue::InMemoryQueue;
//! use tidelog::registry::InMemoryRegistry;
//! use tidelog::subscribers::InMemorySubscriberStore;
//! use tidelog::types::{AppendRequest, CreateRequest};
//! use tidelog::Broker;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Broker::new(
//!         EngineConfig::default(),
//!         Some(Arc::new(InMemoryObjectStore::new())),
//!         Arc::new(InMemoryQueue::new()),
//!         Arc::new(InMemorySubscriberStore::new()),
//!         Arc::new(InMemoryRegistry::new()),
//!     );
//!
//!     broker
//!         .create("demo", "events", CreateRequest {
//!             content_type: Some("text/plain".to_string()),
//!             ..Default::default()
//!         })
//!         .await
//!         .unwrap();
//!
//!     broker
//!         .append("demo", "events", AppendRequest {
//!             payload: Bytes::from_static(b"hello"),
//!             content_type: None,
//!             producer: None,
//!             stream_seq: None,
//!             close: false,
//!         })
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! # Module map
//!
//! Leaves first, in dependency order: [`offset`] and [`limits`] (wire
//! encoding, size/quota checks) → [`segment`] (cold segment codec) →
//! [`storage`] (hot rows + segment index over embedded SQL) → [`producer`]
//! (idempotency state machine) → [`engine`] (the single-writer stream
//! actor) → [`read`] (coalesced offset resolution) → [`delivery`] and
//! [`cursor`] (long-poll/push) → [`fanout`] (cross-stream delivery) →
//! [`Broker`] (the multi-stream entry point). [`registry`],
//! [`subscribers`], [`queue`], and [`objectstore`] are the external
//! collaborator traits the engine and fanout pipeline are generic over, each
//! with an in-memory test double. [`http`] is a thin `axum` adapter used by
//! the `tidelogd` binary; it has no stream semantics of its own.

pub mod broker;
pub mod config;
pub mod cursor;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod http;
pub mod limits;
pub mod objectstore;
pub mod offset;
pub mod path_encoding;
pub mod producer;
pub mod queue;
pub mod read;
pub mod registry;
pub mod segment;
pub mod storage;
pub mod subscribers;
pub mod types;

pub use broker::Broker;
