//! Read Path: coalesced reads across hot rows and cold object segments.
//!
//! The request-coalescing/caching wrapper lives in [`crate::engine`], which
//! owns the bounded in-flight and result maps per stream; this module is the
//! pure function that actually resolves an offset and renders a response.

use bytes::{Bytes, BytesMut};
use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::objectstore::ObjectStore;
use crate::offset::Offset;
use crate::storage::{HotRow, Storage, StreamMeta};
use crate::types::{HeadOutcome, ReadOutcome};

pub fn head(meta: &StreamMeta) -> HeadOutcome {
    let now = Utc::now();
    HeadOutcome {
        content_type: meta.content_type.clone(),
        next_offset: Offset::new(meta.read_seq as u64, meta.tail_offset - meta.segment_start)
            .encode(),
        closed: meta.closed,
        ttl_seconds_remaining: ttl_seconds_remaining(meta, now),
        expires_at: meta.expires_at,
    }
}

/// `now` resolves to an empty body at the tail, marked up to date.
pub fn now(meta: &StreamMeta) -> ReadOutcome {
    let body = if meta.is_json() {
        Bytes::from_static(b"[]")
    } else {
        Bytes::new()
    };
    let next_offset = tail_as_offset(meta).encode();
    ReadOutcome {
        body,
        next_offset: next_offset.clone(),
        up_to_date: true,
        closed_at_tail: meta.closed,
        write_timestamp: None,
        etag: etag(&meta.stream_id, meta.tail_offset, meta.tail_offset, meta.closed),
        content_type: meta.content_type.clone(),
        cache_control: cache_control(meta, Utc::now()),
    }
}

enum Tier {
    Hot,
    Cold { read_seq: u32 },
    Gap,
}

/// Resolves a requested offset to an absolute position and the storage
/// tier (hot, cold, or a gap) it falls in.
fn resolve(meta: &StreamMeta, requested: Offset, has_object_store: bool) -> Result<(u64, Tier), EngineError> {
    let absolute = if requested.read_seq > meta.read_seq as u64 {
        return Err(EngineError::InvalidOffset);
    } else if requested.read_seq == meta.read_seq as u64 {
        let absolute = meta.segment_start + requested.position;
        if absolute > meta.tail_offset {
            return Err(EngineError::OffsetBeyondTail);
        }
        absolute
    } else {
        // Resolved relative to a prior (cold) segment by the caller, via
        // `resolve_cold` below, since that needs a storage lookup.
        return Ok((0, Tier::Cold { read_seq: requested.read_seq as u32 }));
    };

    if !has_object_store || absolute >= meta.segment_start {
        Ok((absolute, Tier::Hot))
    } else {
        Ok((absolute, Tier::Gap))
    }
}

fn tail_as_offset(meta: &StreamMeta) -> Offset {
    Offset::new(meta.read_seq as u64, meta.tail_offset - meta.segment_start)
}

fn ttl_seconds_remaining(meta: &StreamMeta, now: chrono::DateTime<Utc>) -> Option<u64> {
    if let Some(expires_at) = meta.expires_at {
        return Some((expires_at - now).num_seconds().max(0) as u64);
    }
    meta.ttl_seconds.map(|ttl| {
        let created = chrono::DateTime::<Utc>::from_timestamp_millis(meta.created_at).unwrap_or(now);
        let elapsed = (now - created).num_seconds().max(0) as u64;
        ttl.saturating_sub(elapsed)
    })
}

fn etag(stream_id: &str, start: u64, end: u64, closed: bool) -> String {
    if closed {
        format!("{stream_id}:{start}:{end}:c")
    } else {
        format!("{stream_id}:{start}:{end}")
    }
}

fn cache_control(meta: &StreamMeta, now: chrono::DateTime<Utc>) -> String {
    if meta.is_expired(now) {
        return "no-store".to_string();
    }
    match ttl_seconds_remaining(meta, now) {
        Some(remaining) => format!("public, max-age={}", remaining.min(60)),
        None => "public, max-age=60".to_string(),
    }
}

fn render_hot_rows(rows: &[HotRow], absolute_offset: u64, max_bytes: usize, is_json: bool) -> Bytes {
    if is_json {
        let mut out = BytesMut::new();
        out.extend_from_slice(b"[");
        let mut emitted_bytes = 0usize;
        let mut first = true;
        for row in rows {
            if !first && emitted_bytes >= max_bytes {
                break;
            }
            if !first {
                out.extend_from_slice(b",");
            }
            out.extend_from_slice(&row.body);
            emitted_bytes += row.body.len();
            first = false;
        }
        out.extend_from_slice(b"]");
        out.freeze()
    } else {
        let mut out = BytesMut::new();
        for row in rows {
            let remaining = max_bytes.saturating_sub(out.len());
            if remaining == 0 {
                break;
            }
            let skip = absolute_offset.saturating_sub(row.start_offset) as usize;
            let available = &row.body[skip.min(row.body.len())..];
            let take = available.len().min(remaining);
            out.extend_from_slice(&available[..take]);
            if take < available.len() {
                break;
            }
        }
        out.freeze()
    }
}

/// Returns a body prefix from `requested_offset`, resolving hot-vs-cold
/// tier and performing the offset-seek decode on cold segments.
pub async fn read<O: ObjectStore>(
    storage: &Storage,
    object_store: Option<&O>,
    meta: &StreamMeta,
    config: &EngineConfig,
    requested_offset_str: &str,
) -> Result<ReadOutcome, EngineError> {
    let requested = Offset::decode(requested_offset_str)?;
    let (absolute, tier) = resolve(meta, requested, object_store.is_some())?;

    match tier {
        Tier::Cold { read_seq } if requested.read_seq < meta.read_seq as u64 => {
            let segment = storage
                .get_segment(&meta.stream_id, read_seq)?
                .ok_or(EngineError::SegmentUnavailable)?;
            let absolute = segment.start_offset + requested.position;
            read_cold(object_store, meta, config, &segment, absolute).await
        }
        Tier::Hot => read_hot(storage, meta, config, absolute),
        Tier::Gap | Tier::Cold { .. } => Ok(gap_result(meta, absolute)),
    }
}

fn read_hot(storage: &Storage, meta: &StreamMeta, config: &EngineConfig, absolute: u64) -> Result<ReadOutcome, EngineError> {
    let rows = storage.hot_rows_from(&meta.stream_id, absolute)?;
    let body = render_hot_rows(&rows, absolute, config.max_chunk_bytes, meta.is_json());
    let next_absolute = next_absolute_after(&rows, absolute, meta, &body);
    let next_offset = Offset::new(meta.read_seq as u64, next_absolute - meta.segment_start).encode();
    let up_to_date = next_absolute >= meta.tail_offset;
    Ok(ReadOutcome {
        body,
        next_offset,
        up_to_date,
        closed_at_tail: meta.closed && up_to_date,
        write_timestamp: rows.last().map(|r| r.created_at),
        etag: etag(&meta.stream_id, absolute, next_absolute, meta.closed && up_to_date),
        content_type: meta.content_type.clone(),
        cache_control: cache_control(meta, Utc::now()),
    })
}

fn next_absolute_after(rows: &[HotRow], absolute: u64, meta: &StreamMeta, body: &Bytes) -> u64 {
    if rows.is_empty() {
        return absolute.max(meta.segment_start);
    }
    if meta.is_json() {
        // One row == one element; `body` holds as many elements as fit.
        let emitted = body.iter().filter(|&&b| b == b',').count() as u64
            + if body.len() > 2 { 1 } else { 0 };
        rows.first().map(|r| r.start_offset).unwrap_or(absolute) + emitted
    } else {
        absolute + body.len() as u64
    }
}

async fn read_cold<O: ObjectStore>(
    object_store: Option<&O>,
    meta: &StreamMeta,
    config: &EngineConfig,
    segment: &crate::storage::SegmentRow,
    absolute: u64,
) -> Result<ReadOutcome, EngineError> {
    if absolute == segment.end_offset {
        return Ok(gap_result(meta, absolute));
    }
    let object_store = object_store.ok_or(EngineError::SegmentUnavailable)?;
    let blob = object_store
        .get(&segment.object_key)
        .await
        .map_err(|_| EngineError::SegmentUnavailable)?;
    let decoded = crate::segment::decode_from_offset(&blob, absolute, config.max_chunk_bytes);
    if decoded.truncated {
        return Err(EngineError::SegmentTruncated);
    }
    if decoded.records.is_empty() {
        let up_to_date = absolute == meta.tail_offset;
        return Ok(ReadOutcome {
            body: Bytes::new(),
            next_offset: Offset::new(segment.read_seq as u64, absolute - segment.start_offset).encode(),
            up_to_date,
            closed_at_tail: meta.closed && up_to_date,
            write_timestamp: None,
            etag: etag(&meta.stream_id, absolute, absolute, meta.closed && up_to_date),
            content_type: meta.content_type.clone(),
            cache_control: cache_control(meta, Utc::now()),
        });
    }
    let body = if meta.is_json() {
        let mut out = BytesMut::new();
        out.extend_from_slice(b"[");
        for (i, rec) in decoded.records.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b",");
            }
            out.extend_from_slice(&rec.body);
        }
        out.extend_from_slice(b"]");
        out.freeze()
    } else {
        let mut out = BytesMut::new();
        for rec in &decoded.records {
            out.extend_from_slice(&rec.body);
        }
        out.freeze()
    };
    let last = decoded.records.last().unwrap();
    let consumed_end = if meta.is_json() {
        last.start_offset + 1
    } else {
        last.start_offset + last.body.len() as u64
    };
    let up_to_date = consumed_end >= segment.end_offset && consumed_end >= meta.tail_offset;
    Ok(ReadOutcome {
        body,
        next_offset: Offset::new(segment.read_seq as u64, consumed_end - segment.start_offset).encode(),
        up_to_date,
        closed_at_tail: meta.closed && up_to_date,
        write_timestamp: None,
        etag: etag(&meta.stream_id, absolute, consumed_end, meta.closed && up_to_date),
        content_type: meta.content_type.clone(),
        cache_control: cache_control(meta, Utc::now()),
    })
}

fn gap_result(meta: &StreamMeta, absolute: u64) -> ReadOutcome {
    let up_to_date = absolute == meta.tail_offset;
    ReadOutcome {
        body: Bytes::new(),
        next_offset: Offset::new(meta.read_seq as u64, absolute.saturating_sub(meta.segment_start)).encode(),
        up_to_date,
        closed_at_tail: meta.closed && up_to_date,
        write_timestamp: None,
        etag: etag(&meta.stream_id, absolute, absolute, meta.closed && up_to_date),
        content_type: meta.content_type.clone(),
        cache_control: cache_control(meta, Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::InMemoryObjectStore;
    use crate::storage::AppendBatch;
    use bytes::Bytes as B;

    fn fresh_meta(stream_id: &str, content_type: &str) -> StreamMeta {
        StreamMeta {
            stream_id: stream_id.to_string(),
            content_type: Some(content_type.to_string()),
            is_public: false,
            tail_offset: 0,
            read_seq: 0,
            segment_start: 0,
            segment_messages: 0,
            segment_bytes: 0,
            last_stream_seq: None,
            ttl_seconds: None,
            expires_at: None,
            closed: false,
            closed_at: None,
            closed_by_producer_id: None,
            closed_by_epoch: None,
            closed_by_seq: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    fn append_text(storage: &mut Storage, stream_id: &str, body: &[u8]) -> u64 {
        let meta = storage.load_meta(stream_id).unwrap().unwrap();
        let start = meta.tail_offset;
        let end = start + body.len() as u64;
        storage
            .commit_append_batch(
                stream_id,
                &AppendBatch {
                    rows: vec![HotRow {
                        start_offset: start,
                        end_offset: end,
                        size_bytes: body.len() as u64,
                        stream_seq: None,
                        producer_id: None,
                        producer_epoch: None,
                        producer_seq: None,
                        body: B::copy_from_slice(body),
                        created_at: Utc::now().timestamp_millis(),
                    }],
                    new_tail_offset: end,
                    new_segment_messages: meta.segment_messages + 1,
                    new_segment_bytes: meta.segment_bytes + body.len() as u64,
                    new_last_stream_seq: None,
                    close: None,
                    producer_upsert: None,
                },
            )
            .unwrap();
        end
    }

    #[tokio::test]
    async fn now_returns_empty_body_at_tail() {
        let meta = fresh_meta("s1", "text/plain");
        let outcome = now(&meta);
        assert!(outcome.body.is_empty());
        assert!(outcome.up_to_date);
    }

    #[tokio::test]
    async fn hot_read_returns_bytes_from_the_requested_offset() {
        let mut storage = Storage::open_in_memory("read1").unwrap();
        storage.insert_meta(&fresh_meta("s1", "text/plain")).unwrap();
        append_text(&mut storage, "s1", b"AB");
        append_text(&mut storage, "s1", b"CD");
        let meta = storage.load_meta("s1").unwrap().unwrap();
        let config = EngineConfig::default();
        let outcome = read::<InMemoryObjectStore>(&storage, None, &meta, &config, &Offset::new(0, 1).encode())
            .await
            .unwrap();
        assert_eq!(outcome.body, Bytes::from_static(b"BCD"));
        assert!(outcome.up_to_date);
    }

    #[tokio::test]
    async fn read_beyond_tail_is_rejected() {
        let mut storage = Storage::open_in_memory("read2").unwrap();
        storage.insert_meta(&fresh_meta("s1", "text/plain")).unwrap();
        append_text(&mut storage, "s1", b"A");
        let meta = storage.load_meta("s1").unwrap().unwrap();
        let config = EngineConfig::default();
        let err = read::<InMemoryObjectStore>(&storage, None, &meta, &config, &Offset::new(0, 99).encode())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::OffsetBeyondTail);
    }

    #[tokio::test]
    async fn read_seq_ahead_of_meta_is_invalid() {
        let mut storage = Storage::open_in_memory("read3").unwrap();
        storage.insert_meta(&fresh_meta("s1", "text/plain")).unwrap();
        let meta = storage.load_meta("s1").unwrap().unwrap();
        let config = EngineConfig::default();
        let err = read::<InMemoryObjectStore>(&storage, None, &meta, &config, &Offset::new(5, 0).encode())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidOffset);
    }
}
