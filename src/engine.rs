//! Stream Engine: the single-writer critical section per stream.
//!
//! One [`StreamEngine`] owns exactly one stream's [`Storage`]. Mutating
//! operations serialize through `gate`, a [`tokio::sync::Mutex`] — chosen
//! over `std::sync::Mutex` because a panic inside the guarded callback must
//! not poison the instance; tokio's mutex has no poisoning concept at all,
//! so a panicking append leaves the next append free to proceed.
//! The `gate_mutex_does_not_poison_on_panic_while_held` test below is the
//! required proof.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::config::EngineConfig;
use crate::cursor;
use crate::delivery::{Broadcaster, DeliveryEvent, ResponseCache, WaiterQueue};
use crate::error::EngineError;
use crate::limits;
use crate::objectstore::{self, ObjectStore};
use crate::offset::Offset;
use crate::producer::{self, ProducerDecision};
use crate::storage::{AppendBatch, CloseFields, HotRow, ProducerRecord, Storage, StreamMeta};
use crate::types::{
    AppendOutcome, AppendRequest, CreateOutcome, CreateRequest, Expiry, FanoutTrigger,
    HeadOutcome, ReadOutcome,
};

/// Fired after a non-empty append commits; the owning [`crate::Broker`]
/// plugs [`crate::fanout`] in here. Kept out of the engine's type parameters
/// so the engine and the fanout pipeline don't need to know about each other.
pub type FanoutHook = Arc<dyn Fn(FanoutTrigger) + Send + Sync>;

pub struct StreamEngine<O: ObjectStore> {
    project_id: String,
    stream_id: String,
    config: EngineConfig,
    gate: Mutex<Storage>,
    read_storage: Storage,
    object_store: Option<Arc<O>>,
    waiters: WaiterQueue,
    broadcaster: Broadcaster,
    response_cache: ResponseCache,
    read_coalescer: ReadCoalescer,
    fanout_hook: Option<FanoutHook>,
}

impl<O: ObjectStore> StreamEngine<O> {
    pub fn new(
        project_id: String,
        stream_id: String,
        config: EngineConfig,
        storage: Storage,
        object_store: Option<Arc<O>>,
        fanout_hook: Option<FanoutHook>,
    ) -> Result<Self, EngineError> {
        let read_storage = storage.read_only_handle()?;
        let read_cache_ttl = Duration::from_millis(config.read_cache_ttl_ms);
        let read_coalesce_capacity = config.read_coalesce_capacity;
        Ok(Self {
            project_id,
            stream_id,
            read_storage,
            object_store,
            waiters: WaiterQueue::new(),
            broadcaster: Broadcaster::new(),
            response_cache: ResponseCache::new(read_cache_ttl, read_coalesce_capacity),
            read_coalescer: ReadCoalescer::new(read_cache_ttl, read_coalesce_capacity),
            fanout_hook,
            gate: Mutex::new(storage),
            config,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.broadcaster.subscribe()
    }

    // -- creation ---------------------------------------------------------

    pub async fn create_or_idempotent(&self, request: CreateRequest) -> Result<CreateOutcome, EngineError> {
        let mut storage = self.gate.lock().await;

        if let Some(existing) = storage.load_meta(&self.stream_id)? {
            let ct_matches = existing.content_type == request.content_type;
            let closed_matches = existing.closed == request.close;
            let expiry_matches = expiry_matches(&existing, &request.expiry);
            if !ct_matches || !closed_matches || !expiry_matches {
                return Err(EngineError::Conflict {
                    reason: "create params do not match existing stream".to_string(),
                });
            }
            return Ok(CreateOutcome {
                created: false,
                next_offset: tail_offset_of(&existing).encode(),
            });
        }

        if let Some(body) = &request.initial_body {
            limits::check_append_size(&self.config, body.len())?;
        }

        let (ttl_seconds, expires_at) = match request.expiry {
            Some(Expiry::TtlSeconds(ttl)) => (Some(ttl), None),
            Some(Expiry::ExpiresAt(at)) => (None, Some(at)),
            None => (None, None),
        };

        let meta = StreamMeta {
            stream_id: self.stream_id.clone(),
            content_type: request.content_type.clone(),
            is_public: request.public,
            tail_offset: 0,
            read_seq: 0,
            segment_start: 0,
            segment_messages: 0,
            segment_bytes: 0,
            last_stream_seq: None,
            ttl_seconds,
            expires_at,
            closed: false,
            closed_at: None,
            closed_by_producer_id: None,
            closed_by_epoch: None,
            closed_by_seq: None,
            created_at: Utc::now().timestamp_millis(),
        };
        storage.insert_meta(&meta)?;

        let mut fanout_trigger = None;
        let mut next_offset = Offset::ZERO;

        if let Some(body) = request.initial_body.filter(|b| !b.is_empty()) {
            let producer_upsert = request.producer.as_ref().map(|p| ProducerRecord {
                producer_id: p.id.clone(),
                epoch: p.epoch,
                last_seq: p.seq,
                last_offset: 0,
                last_updated: Utc::now().timestamp_millis(),
            });
            let batch = build_append_batch(
                &meta,
                body.clone(),
                request.producer.as_ref(),
                request.stream_seq.clone(),
                request.close,
                producer_upsert,
            )?;
            next_offset = Offset::new(0, batch.new_tail_offset);
            storage.commit_append_batch(&self.stream_id, &batch)?;

            if self.fanout_hook.is_some() {
                let subscribers = storage.list_subscribers(&self.stream_id)?;
                if !subscribers.is_empty() {
                    let fanout_seq = storage.next_fanout_seq(&self.stream_id)?;
                    fanout_trigger = Some(FanoutTrigger {
                        project_id: self.project_id.clone(),
                        source_stream_id: self.stream_id.clone(),
                        payload: body,
                        content_type: meta.content_type.clone(),
                        subscribers,
                        fanout_seq,
                    });
                }
            }
        } else if request.close {
            storage.update_meta_fields(
                &self.stream_id,
                0,
                0,
                0,
                None,
                Some(&CloseFields {
                    closed_at: Utc::now().timestamp_millis(),
                    closed_by_producer_id: request.producer.as_ref().map(|p| p.id.clone()),
                    closed_by_epoch: request.producer.as_ref().map(|p| p.epoch),
                    closed_by_seq: request.producer.as_ref().map(|p| p.seq),
                }),
            )?;
        }

        self.maybe_rotate(&mut storage, request.close).await?;
        drop(storage);

        if let (Some(hook), Some(trigger)) = (&self.fanout_hook, fanout_trigger) {
            hook(trigger);
        }

        Ok(CreateOutcome {
            created: true,
            next_offset: next_offset.encode(),
        })
    }

    // -- append -------------------------------------------------------------

    pub async fn append(&self, request: AppendRequest) -> Result<AppendOutcome, EngineError> {
        limits::check_append_size(&self.config, request.payload.len())?;
        let mut storage = self.gate.lock().await;
        let meta = storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;

        if meta.closed {
            return self.handle_closed_append(&mut storage, &meta, request).await;
        }

        if let Some(ct) = &request.content_type {
            if meta.content_type.as_deref() != Some(ct.as_str()) {
                return Err(EngineError::Conflict {
                    reason: "content-type mismatch".to_string(),
                });
            }
        }

        limits::check_quota(&self.config, meta.segment_bytes)?;

        let producer_record = match &request.producer {
            Some(p) => self.lookup_producer(&storage, &p.id)?,
            None => None,
        };

        let decision = match &request.producer {
            Some(p) => producer::evaluate(producer_record.as_ref(), p.epoch, p.seq),
            None => ProducerDecision::NoTriple,
        };

        if let ProducerDecision::DuplicateReplay { prior_offset } = decision {
            let next_offset = encode_historic_offset(&storage, &self.stream_id, &meta, prior_offset)?;
            return Ok(AppendOutcome {
                status: if request.producer.is_some() { 200 } else { 204 },
                next_offset: next_offset.encode(),
                closed: meta.closed,
            });
        }
        if let Some(err) = producer::decision_error(&decision) {
            return Err(err);
        }

        if let Some(stream_seq) = &request.stream_seq {
            if let Some(last) = &meta.last_stream_seq {
                if stream_seq.as_str() <= last.as_str() {
                    return Err(EngineError::SeqRegression);
                }
            }
        }

        let producer_upsert = request.producer.as_ref().map(|p| ProducerRecord {
            producer_id: p.id.clone(),
            epoch: p.epoch,
            last_seq: p.seq,
            last_offset: 0, // filled in by build_append_batch once the tail is known
            last_updated: Utc::now().timestamp_millis(),
        });

        let batch = build_append_batch(
            &meta,
            request.payload.clone(),
            request.producer.as_ref(),
            request.stream_seq.clone(),
            request.close,
            producer_upsert,
        )?;
        let new_tail = batch.new_tail_offset;
        let ready_urls = self.waiters.ready_waiter_urls(new_tail);
        storage.commit_append_batch(&self.stream_id, &batch)?;

        for url in &ready_urls {
            if let Ok(outcome) = self.render_for_precache(&storage, url).await {
                self.response_cache.put(url, outcome.body);
            }
        }

        self.waiters.notify(new_tail, self.config.long_poll_stagger_ms);
        self.broadcaster.publish(DeliveryEvent::Data {
            body: request.payload.clone(),
        });
        self.broadcaster.publish(DeliveryEvent::Control {
            next_offset: Offset::new(meta.read_seq as u64, new_tail - meta.segment_start).encode(),
            up_to_date: true,
            closed: request.close.then_some(true),
            write_timestamp: Some(Utc::now().timestamp_millis()),
            cursor: cursor::current_interval(&self.config),
        });

        self.maybe_rotate(&mut storage, request.close).await?;

        let mut fanout_trigger = None;
        if !request.payload.is_empty() {
            if self.fanout_hook.is_some() {
                let subscribers = storage.list_subscribers(&self.stream_id)?;
                if !subscribers.is_empty() {
                    let fanout_seq = storage.next_fanout_seq(&self.stream_id)?;
                    fanout_trigger = Some(FanoutTrigger {
                        project_id: self.project_id.clone(),
                        source_stream_id: self.stream_id.clone(),
                        payload: request.payload.clone(),
                        content_type: meta.content_type.clone(),
                        subscribers,
                        fanout_seq,
                    });
                }
            }
        }
        drop(storage);

        if let (Some(hook), Some(trigger)) = (&self.fanout_hook, fanout_trigger) {
            hook(trigger);
        }

        Ok(AppendOutcome {
            status: if request.producer.is_some() { 200 } else { 204 },
            next_offset: Offset::new(meta.read_seq as u64, new_tail - meta.segment_start).encode(),
            closed: request.close,
        })
    }

    pub async fn close_only(&self, producer: Option<crate::types::ProducerTriple>) -> Result<AppendOutcome, EngineError> {
        self.append(AppendRequest {
            payload: Bytes::new(),
            content_type: None,
            producer,
            stream_seq: None,
            close: true,
        })
        .await
    }

    async fn handle_closed_append(
        &self,
        storage: &mut Storage,
        meta: &StreamMeta,
        request: AppendRequest,
    ) -> Result<AppendOutcome, EngineError> {
        if request.payload.is_empty() && request.close {
            return Ok(AppendOutcome {
                status: 204,
                next_offset: tail_offset_of(meta).encode(),
                closed: true,
            });
        }
        if let Some(p) = &request.producer {
            let record = self.lookup_producer(storage, &p.id)?;
            if let ProducerDecision::DuplicateReplay { prior_offset } =
                producer::evaluate(record.as_ref(), p.epoch, p.seq)
            {
                let next_offset = encode_historic_offset(storage, &self.stream_id, meta, prior_offset)?;
                return Ok(AppendOutcome {
                    status: 200,
                    next_offset: next_offset.encode(),
                    closed: true,
                });
            }
        }
        Err(EngineError::ClosedConflict)
    }

    fn lookup_producer(&self, storage: &Storage, producer_id: &str) -> Result<Option<ProducerRecord>, EngineError> {
        let record = storage.get_producer(&self.stream_id, producer_id)?;
        match record {
            Some(r) if producer::is_expired(&r, &self.config) => {
                storage.delete_producer(&self.stream_id, producer_id)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn render_for_precache(&self, storage: &Storage, url: &str) -> Result<ReadOutcome, EngineError> {
        let meta = storage.load_meta(&self.stream_id)?.ok_or(EngineError::NotFound)?;
        crate::read::read(storage, self.object_store.as_deref(), &meta, &self.config, url).await
    }

    // -- read ---------------------------------------------------------------

    pub async fn head(&self) -> Result<HeadOutcome, EngineError> {
        let meta = self
            .read_storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;
        Ok(crate::read::head(&meta))
    }

    pub async fn now(&self) -> Result<ReadOutcome, EngineError> {
        let meta = self
            .read_storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;
        Ok(crate::read::now(&meta))
    }

    pub async fn read(&self, offset: &str) -> Result<ReadOutcome, EngineError> {
        let meta = self
            .read_storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;
        let key = format!("{}:{}:{}:{}", meta.tail_offset, meta.closed, offset, self.config.max_chunk_bytes);
        if let Some(cached) = self.response_cache.take(offset) {
            return Ok(ReadOutcome {
                body: cached,
                next_offset: offset.to_string(),
                up_to_date: true,
                closed_at_tail: meta.closed,
                write_timestamp: None,
                etag: String::new(),
                content_type: meta.content_type.clone(),
                cache_control: "public, max-age=60".to_string(),
            });
        }
        let storage = &self.read_storage;
        let object_store = self.object_store.as_deref();
        let config = &self.config;
        let offset_owned = offset.to_string();
        self.read_coalescer
            .coalesced(key, || async move {
                crate::read::read(storage, object_store, &meta, config, &offset_owned).await
            })
            .await
    }

    // -- deletion -------------------------------------------------------------

    pub async fn delete(&self) -> Result<(), EngineError> {
        let storage = self.gate.lock().await;
        if storage.load_meta(&self.stream_id)?.is_none() {
            return Err(EngineError::NotFound);
        }
        storage.delete_stream(&self.stream_id)?;
        self.waiters.notify_all();
        Ok(())
    }

    /// Whether this stream's TTL/expires-at has passed, for
    /// [`crate::Broker::sweep_expired`]'s interval-based eviction.
    pub async fn is_expired(&self) -> Result<bool, EngineError> {
        let meta = self
            .read_storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;
        Ok(meta.is_expired(Utc::now()))
    }

    pub async fn add_subscriber(&self, estuary_id: &str) -> Result<(), EngineError> {
        let storage = self.gate.lock().await;
        storage.add_subscriber(&self.stream_id, estuary_id)
    }

    /// Long-poll: resolves immediately if `requested_offset` is
    /// already behind the tail or the stream is closed; otherwise parks in
    /// the waiter queue until new data lands or `timeout_ms` elapses, then
    /// re-reads. `request_url`, when given, doubles as the pre-cache key an
    /// in-flight append may already have rendered by the time this wakes.
    pub async fn wait_for_tail(
        &self,
        requested_offset: &str,
        request_url: Option<String>,
        timeout_ms: u64,
    ) -> Result<ReadOutcome, EngineError> {
        let requested = Offset::decode(requested_offset)?;
        let meta = self
            .read_storage
            .load_meta(&self.stream_id)?
            .ok_or(EngineError::NotFound)?;

        let caught_up = requested.read_seq < meta.read_seq as u64
            || (requested.read_seq == meta.read_seq as u64
                && meta.segment_start + requested.position < meta.tail_offset);
        if caught_up || meta.closed {
            return self.read(requested_offset).await;
        }

        if let Some(url) = &request_url {
            if let Some(cached) = self.response_cache.take(url) {
                return Ok(ReadOutcome {
                    body: cached,
                    next_offset: requested_offset.to_string(),
                    up_to_date: true,
                    closed_at_tail: meta.closed,
                    write_timestamp: None,
                    etag: String::new(),
                    content_type: meta.content_type.clone(),
                    cache_control: "public, max-age=60".to_string(),
                });
            }
        }

        let absolute = meta.segment_start + requested.position;
        let timed_out = self.waiters.wait(absolute, request_url, timeout_ms).await;
        if timed_out {
            return self.now().await;
        }
        self.read(requested_offset).await
    }

    // -- rotation ---------------------------------------------------

    async fn maybe_rotate(&self, storage: &mut Storage, force: bool) -> Result<(), EngineError> {
        let meta = storage.load_meta(&self.stream_id)?.ok_or(EngineError::NotFound)?;
        let should_rotate = force
            || meta.segment_messages >= self.config.rotation_max_messages
            || meta.segment_bytes >= self.config.rotation_max_bytes;
        if !should_rotate || meta.segment_start >= meta.tail_offset {
            return Ok(());
        }
        let Some(object_store) = &self.object_store else {
            return Ok(());
        };

        let rows = storage.hot_rows_in_range(&self.stream_id, meta.segment_start, meta.tail_offset)?;
        if rows.is_empty() {
            return Ok(());
        }
        let blob = crate::segment::encode(
            &rows.iter().map(|r| (r.start_offset, r.body.clone())).collect::<Vec<_>>(),
        );
        let key = objectstore::segment_key(&self.stream_id, meta.read_seq);

        if object_store.put(&key, blob.clone()).await.is_err() {
            // Abort rotation; hot rows stay intact and the next trigger retries.
            return Ok(());
        }

        storage.insert_segment(
            &self.stream_id,
            &crate::storage::SegmentRow {
                read_seq: meta.read_seq,
                object_key: key,
                start_offset: meta.segment_start,
                end_offset: meta.tail_offset,
                content_type: meta.content_type.clone(),
                size_bytes: blob.len() as u64,
                message_count: rows.len() as u64,
                expires_at: meta.expires_at,
                created_at: Utc::now().timestamp_millis(),
            },
        )?;
        storage.advance_rotation(&self.stream_id, meta.tail_offset, meta.read_seq + 1)?;
        if self.config.delete_hot_rows_after_rotation {
            storage.delete_hot_rows_before(&self.stream_id, meta.tail_offset)?;
        }
        Ok(())
    }
}

fn tail_offset_of(meta: &StreamMeta) -> Offset {
    Offset::new(meta.read_seq as u64, meta.tail_offset - meta.segment_start)
}

/// Encodes an absolute offset recorded on some producer's record, which may
/// point into the current hot segment or into one rotated away since. A
/// producer record survives rotation untouched, so a duplicate replay
/// against an old triple can name an offset below `meta.segment_start`.
fn encode_historic_offset(
    storage: &Storage,
    stream_id: &str,
    meta: &StreamMeta,
    absolute: u64,
) -> Result<Offset, EngineError> {
    if absolute >= meta.segment_start {
        return Ok(Offset::new(meta.read_seq as u64, absolute - meta.segment_start));
    }
    if let Some(segment) = storage.segment_covering(stream_id, absolute)? {
        return Ok(Offset::new(segment.read_seq as u64, absolute - segment.start_offset));
    }
    if let Some(segment) = storage.segment_starting_at(stream_id, absolute)? {
        return Ok(Offset::new(segment.read_seq as u64, 0));
    }
    Err(EngineError::SegmentUnavailable)
}

fn expiry_matches(existing: &StreamMeta, requested: &Option<Expiry>) -> bool {
    match requested {
        None => existing.ttl_seconds.is_none() && existing.expires_at.is_none(),
        Some(Expiry::TtlSeconds(ttl)) => existing.ttl_seconds == Some(*ttl),
        Some(Expiry::ExpiresAt(at)) => existing.expires_at == Some(*at),
    }
}

/// Append batch construction: one row per message (one row per JSON
/// element, or one row for the whole textual/binary payload).
fn build_append_batch(
    meta: &StreamMeta,
    payload: Bytes,
    producer: Option<&crate::types::ProducerTriple>,
    stream_seq: Option<String>,
    close: bool,
    mut producer_upsert: Option<ProducerRecord>,
) -> Result<AppendBatch, EngineError> {
    let mut rows = Vec::new();
    let mut offset = meta.tail_offset;

    if meta.is_json() {
        let value: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|_| EngineError::BadRequest { detail: "malformed JSON body".to_string() })?;
        let elements: Vec<serde_json::Value> = match value {
            serde_json::Value::Array(items) => {
                if items.is_empty() {
                    return Err(EngineError::BadRequest { detail: "empty JSON array".to_string() });
                }
                items
            }
            single => vec![single],
        };
        for element in elements {
            let body = Bytes::from(serde_json::to_vec(&element).unwrap_or_default());
            rows.push(HotRow {
                start_offset: offset,
                end_offset: offset + 1,
                size_bytes: body.len() as u64,
                stream_seq: None,
                producer_id: producer.map(|p| p.id.clone()),
                producer_epoch: producer.map(|p| p.epoch),
                producer_seq: producer.map(|p| p.seq),
                body,
                created_at: Utc::now().timestamp_millis(),
            });
            offset += 1;
        }
    } else if !payload.is_empty() {
        let len = payload.len() as u64;
        rows.push(HotRow {
            start_offset: offset,
            end_offset: offset + len,
            size_bytes: len,
            stream_seq: stream_seq.clone(),
            producer_id: producer.map(|p| p.id.clone()),
            producer_epoch: producer.map(|p| p.epoch),
            producer_seq: producer.map(|p| p.seq),
            body: payload,
            created_at: Utc::now().timestamp_millis(),
        });
        offset += len;
    }

    if let Some(upsert) = producer_upsert.as_mut() {
        upsert.last_offset = offset;
    }

    Ok(AppendBatch {
        new_segment_messages: meta.segment_messages + rows.len() as u64,
        new_segment_bytes: meta.segment_bytes + rows.iter().map(|r| r.size_bytes).sum::<u64>(),
        new_last_stream_seq: stream_seq,
        close: close.then(|| CloseFields {
            closed_at: Utc::now().timestamp_millis(),
            closed_by_producer_id: producer.map(|p| p.id.clone()),
            closed_by_epoch: producer.map(|p| p.epoch),
            closed_by_seq: producer.map(|p| p.seq),
        }),
        producer_upsert,
        new_tail_offset: offset,
        rows,
    })
}

/// "Coalescing and caching": dedupe in-flight identical reads and cache
/// the result briefly, bounded so a pathological key space can't grow
/// unbounded (overflow just runs uncoalesced, which is always correct).
struct ReadCoalescer {
    in_flight: Mutex<HashMap<String, broadcast::Sender<CoalescedResult>>>,
    cache: Mutex<HashMap<String, (CoalescedResult, Instant)>>,
    ttl: Duration,
    capacity: usize,
}

type CoalescedResult = Result<ReadOutcome, EngineError>;

impl ReadCoalescer {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    async fn coalesced<F, Fut>(&self, key: String, compute: F) -> CoalescedResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoalescedResult>,
    {
        if let Some((result, put_at)) = self.cache.lock().await.get(&key) {
            if put_at.elapsed() <= self.ttl {
                return result.clone();
            }
        }

        let mut in_flight = self.in_flight.lock().await;
        if let Some(sender) = in_flight.get(&key) {
            let mut rx = sender.subscribe();
            drop(in_flight);
            return rx.recv().await.unwrap_or(Err(EngineError::Internal(
                "coalesced read sender dropped".to_string(),
            )));
        }
        if in_flight.len() >= self.capacity {
            drop(in_flight);
            return compute().await;
        }
        let (tx, _) = broadcast::channel(1);
        in_flight.insert(key.clone(), tx.clone());
        drop(in_flight);

        let result = compute().await;
        self.in_flight.lock().await.remove(&key);
        let mut cache = self.cache.lock().await;
        if cache.len() < self.capacity || cache.contains_key(&key) {
            cache.insert(key, (result.clone(), Instant::now()));
        }
        drop(cache);
        let _ = tx.send(result.clone());
        result
    }
}
