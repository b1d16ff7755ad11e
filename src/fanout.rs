//! Fanout Pipeline: async cross-stream delivery into estuary streams.
//!
//! Dispatch is inline for a small subscriber set and queued for a large one,
//! per [`EngineConfig::fanout_inline_threshold`]. Either path ends up calling
//! [`crate::engine::StreamEngine::append`] on the destination with a
//! synthesized producer triple, reusing the same dedup machinery writers get.

use bytes::Bytes;
use tracing::warn;

use crate::config::EngineConfig;
use crate::queue::{DurableQueue, FanoutMessage, ProducerHeaders};
use crate::registry::{self, Registry};
use crate::subscribers::SubscriberStore;
use crate::types::{AppendRequest, FanoutTrigger, ProducerTriple};

#[cfg(test)]
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// The synthesized producer id a source stream's fanout writes under at an
/// estuary, so replays and concurrent estuary writers from the same source
/// dedup the same way a direct client write would.
fn fanout_producer_id(source_stream_id: &str) -> String {
    format!("{source_stream_id}:fanout")
}

const FANOUT_PRODUCER_EPOCH: u64 = 0;

/// One estuary's outcome from a fanout dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    AlreadyDelivered,
    EstuaryGone,
    Failed(String),
}

/// Appends `payload` into `estuary_stream_id`, synthesizing the fanout
/// producer triple from `source_stream_id`/`fanout_seq`.
pub async fn dispatch_to_estuary<A>(
    appender: &A,
    estuary_stream_id: &str,
    source_stream_id: &str,
    payload: Bytes,
    content_type: Option<String>,
    fanout_seq: u64,
) -> DispatchOutcome
where
    A: EstuaryAppender,
{
    let request = AppendRequest {
        payload,
        content_type,
        producer: Some(ProducerTriple {
            id: fanout_producer_id(source_stream_id),
            epoch: FANOUT_PRODUCER_EPOCH,
            seq: fanout_seq,
        }),
        stream_seq: None,
        close: false,
    };
    match appender.append(estuary_stream_id, request).await {
        Ok(outcome) if outcome.status == 200 => DispatchOutcome::Delivered,
        Ok(_) => DispatchOutcome::AlreadyDelivered,
        Err(crate::error::EngineError::NotFound) => DispatchOutcome::EstuaryGone,
        Err(e) => DispatchOutcome::Failed(e.to_string()),
    }
}

/// Abstraction over "append to some other stream by id", so this module
/// doesn't need to know how [`crate::Broker`] looks streams up.
pub trait EstuaryAppender: Send + Sync {
    fn append(
        &self,
        estuary_stream_id: &str,
        request: AppendRequest,
    ) -> impl std::future::Future<Output = Result<crate::types::AppendOutcome, crate::error::EngineError>> + Send;
}

/// Entry point the engine's `on_append` hook calls: dispatch inline or
/// queued. Below the threshold, every subscriber is dispatched inline and
/// awaited; at or above it, the trigger is handed to `queue` instead so the
/// calling append doesn't block on however many estuaries are subscribed.
pub async fn handle_trigger<A, Q>(appender: &A, queue: &Q, config: &EngineConfig, trigger: FanoutTrigger)
where
    A: EstuaryAppender,
    Q: DurableQueue,
{
    if trigger.subscribers.len() < config.fanout_inline_threshold {
        for estuary_id in &trigger.subscribers {
            let outcome = dispatch_to_estuary(
                appender,
                estuary_id,
                &trigger.source_stream_id,
                trigger.payload.clone(),
                trigger.content_type.clone(),
                trigger.fanout_seq,
            )
            .await;
            if let DispatchOutcome::Failed(reason) = outcome {
                warn!(estuary_id, reason, "inline fanout dispatch failed");
            }
        }
        return;
    }

    let producer_id = fanout_producer_id(&trigger.source_stream_id);
    let message = FanoutMessage {
        project_id: trigger.project_id,
        source_stream_id: trigger.source_stream_id,
        estuary_ids: trigger.subscribers,
        payload_base64: FanoutMessage::encode_payload(&trigger.payload),
        content_type: trigger.content_type,
        producer_headers: Some(ProducerHeaders {
            producer_id,
            producer_epoch: FANOUT_PRODUCER_EPOCH,
            producer_seq: trigger.fanout_seq,
        }),
    };
    if let Err(e) = queue.enqueue(message).await {
        warn!(error = %e, "failed to enqueue fanout message");
    }
}

/// Pops one fanout message, dispatches to every named estuary, prunes
/// subscribers that no longer exist, and acks/nacks based on the outcome.
pub async fn run_queue_consumer_once<A, Q, S, R>(
    appender: &A,
    queue: &Q,
    subscribers: &S,
    registry: &R,
) -> Result<bool, crate::error::EngineError>
where
    A: EstuaryAppender,
    Q: DurableQueue,
    S: SubscriberStore,
    R: Registry,
{
    let Some((message, handle)) = queue.dequeue().await else {
        return Ok(false);
    };

    let producer_seq = message
        .producer_headers
        .as_ref()
        .map(|h| h.producer_seq)
        .unwrap_or(0);
    let payload = message
        .decode_payload()
        .map(Bytes::from)
        .unwrap_or_default();

    let mut stale = Vec::new();
    let mut any_failed = false;
    for estuary_id in &message.estuary_ids {
        let outcome = dispatch_to_estuary(
            appender,
            estuary_id,
            &message.source_stream_id,
            payload.clone(),
            message.content_type.clone(),
            producer_seq,
        )
        .await;
        match outcome {
            DispatchOutcome::Delivered | DispatchOutcome::AlreadyDelivered => {}
            DispatchOutcome::EstuaryGone => stale.push(estuary_id.clone()),
            DispatchOutcome::Failed(reason) => {
                any_failed = true;
                warn!(estuary_id, reason, "queued fanout dispatch failed");
            }
        }
    }

    if !stale.is_empty() {
        subscribers.remove_subscribers(&message.source_stream_id, &stale).await;
        for estuary_id in &stale {
            registry::cleanup_with_retry(registry, estuary_id).await;
        }
    }

    if any_failed {
        let _ = queue.nack(handle).await;
    } else {
        let _ = queue.ack(handle).await;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::queue::InMemoryQueue;
    use crate::registry::InMemoryRegistry;
    use crate::subscribers::InMemorySubscriberStore;
    use crate::types::AppendOutcome;
    use std::sync::Mutex;

    struct RecordingAppender {
        seen: Mutex<Vec<(String, ProducerTriple)>>,
        fail_for: Option<String>,
        not_found_for: Option<String>,
    }

    impl EstuaryAppender for RecordingAppender {
        async fn append(
            &self,
            estuary_stream_id: &str,
            request: AppendRequest,
        ) -> Result<AppendOutcome, EngineError> {
            if self.not_found_for.as_deref() == Some(estuary_stream_id) {
                return Err(EngineError::NotFound);
            }
            if self.fail_for.as_deref() == Some(estuary_stream_id) {
                return Err(EngineError::Internal("boom".to_string()));
            }
            self.seen
                .lock()
                .unwrap()
                .push((estuary_stream_id.to_string(), request.producer.clone().unwrap()));
            Ok(AppendOutcome {
                status: 200,
                next_offset: "x".to_string(),
                closed: false,
            })
        }
    }

    #[tokio::test]
    async fn below_threshold_dispatches_inline_to_every_subscriber() {
        let appender = RecordingAppender {
            seen: Mutex::new(Vec::new()),
            fail_for: None,
            not_found_for: None,
        };
        let queue = InMemoryQueue::default();
        let config = EngineConfig {
            fanout_inline_threshold: 16,
            ..Default::default()
        };
        let trigger = FanoutTrigger {
            project_id: "p".to_string(),
            source_stream_id: "src".to_string(),
            payload: Bytes::from_static(b"hi"),
            content_type: None,
            subscribers: vec!["a".to_string(), "b".to_string()],
            fanout_seq: 7,
        };
        handle_trigger(&appender, &queue, &config, trigger).await;
        let seen = appender.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1.id, "src:fanout");
        assert_eq!(seen[0].1.seq, 7);
    }

    #[tokio::test]
    async fn at_threshold_enqueues_instead_of_dispatching() {
        let appender = RecordingAppender {
            seen: Mutex::new(Vec::new()),
            fail_for: None,
            not_found_for: None,
        };
        let queue = InMemoryQueue::default();
        let config = EngineConfig {
            fanout_inline_threshold: 1,
            ..Default::default()
        };
        let trigger = FanoutTrigger {
            project_id: "p".to_string(),
            source_stream_id: "src".to_string(),
            payload: Bytes::from_static(b"hi"),
            content_type: None,
            subscribers: vec!["a".to_string(), "b".to_string()],
            fanout_seq: 1,
        };
        handle_trigger(&appender, &queue, &config, trigger).await;
        assert!(appender.seen.lock().unwrap().is_empty());
        let (message, _) = queue.dequeue().await.unwrap();
        assert_eq!(message.estuary_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stale_subscriber_is_pruned_after_not_found() {
        let appender = RecordingAppender {
            seen: Mutex::new(Vec::new()),
            fail_for: None,
            not_found_for: Some("gone".to_string()),
        };
        let queue = InMemoryQueue::default();
        let subscribers = InMemorySubscriberStore::default();
        subscribers.add("src", "gone");
        subscribers.add("src", "alive");
        let registry = InMemoryRegistry::default();

        queue
            .enqueue(FanoutMessage {
                project_id: "p".to_string(),
                source_stream_id: "src".to_string(),
                estuary_ids: vec!["gone".to_string(), "alive".to_string()],
                payload_base64: STANDARD.encode(b"hi"),
                content_type: None,
                producer_headers: Some(ProducerHeaders {
                    producer_id: String::new(),
                    producer_epoch: 0,
                    producer_seq: 1,
                }),
            })
            .await
            .unwrap();

        let processed = run_queue_consumer_once(&appender, &queue, &subscribers, &registry)
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(subscribers.subscribers_of("src").await, vec!["alive".to_string()]);
    }

    #[tokio::test]
    async fn empty_queue_reports_no_work() {
        let appender = RecordingAppender {
            seen: Mutex::new(Vec::new()),
            fail_for: None,
            not_found_for: None,
        };
        let queue = InMemoryQueue::default();
        let subscribers = InMemorySubscriberStore::default();
        let registry = InMemoryRegistry::default();
        let processed = run_queue_consumer_once(&appender, &queue, &subscribers, &registry)
            .await
            .unwrap();
        assert!(!processed);
    }

    #[tokio::test]
    async fn dispatch_failure_is_nacked_not_dropped() {
        let appender = RecordingAppender {
            seen: Mutex::new(Vec::new()),
            fail_for: Some("broken".to_string()),
            not_found_for: None,
        };
        let queue = InMemoryQueue::default();
        let subscribers = InMemorySubscriberStore::default();
        let registry = InMemoryRegistry::default();
        queue
            .enqueue(FanoutMessage {
                project_id: "p".to_string(),
                source_stream_id: "src".to_string(),
                estuary_ids: vec!["broken".to_string()],
                payload_base64: STANDARD.encode(b"hi"),
                content_type: None,
                producer_headers: None,
            })
            .await
            .unwrap();

        run_queue_consumer_once(&appender, &queue, &subscribers, &registry)
            .await
            .unwrap();
        // nacked messages go back to the tail and can be dequeued again.
        assert!(queue.dequeue().await.is_some());
    }
}
