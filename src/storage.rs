//! Stream Storage: row-oriented hot log + segment index over embedded SQL.
//!
//! WAL mode, PRAGMAs applied at open, schema loaded via `include_str!`. One
//! [`Storage`] instance backs exactly one stream actor, so it needs no
//! internal locking: the actor's single-writer gate already serializes
//! mutating access, and reads run against their own handle (see
//! [`Storage::read_only_handle`]).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Where a [`Storage`]'s connection points, kept so [`Storage::read_only_handle`]
/// can open a second connection onto the same database.
#[derive(Clone)]
enum Location {
    /// A named shared-cache in-memory database; stays alive only while at
    /// least one connection (this one) is open.
    Memory(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub stream_id: String,
    pub content_type: Option<String>,
    pub is_public: bool,
    pub tail_offset: u64,
    pub read_seq: u32,
    pub segment_start: u64,
    pub segment_messages: u64,
    pub segment_bytes: u64,
    pub last_stream_seq: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by_producer_id: Option<String>,
    pub closed_by_epoch: Option<u64>,
    pub closed_by_seq: Option<u64>,
    pub created_at: i64,
}

impl StreamMeta {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(crate::limits::normalize_content_type)
            .as_deref()
            == Some("application/json")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if let Some(expires_at) = self.expires_at {
            return now >= expires_at;
        }
        if let Some(ttl) = self.ttl_seconds {
            let created = DateTime::<Utc>::from_timestamp_millis(self.created_at).unwrap_or(now);
            return now >= created + chrono::Duration::seconds(ttl as i64);
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub producer_id: String,
    pub epoch: u64,
    pub last_seq: u64,
    pub last_offset: u64,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct HotRow {
    pub start_offset: u64,
    pub end_offset: u64,
    pub size_bytes: u64,
    pub stream_seq: Option<String>,
    pub producer_id: Option<String>,
    pub producer_epoch: Option<u64>,
    pub producer_seq: Option<u64>,
    pub body: Bytes,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub read_seq: u32,
    pub object_key: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub message_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: i64,
}

/// New-message rows plus the metadata delta to apply atomically.
pub struct AppendBatch {
    pub rows: Vec<HotRow>,
    pub new_tail_offset: u64,
    pub new_segment_messages: u64,
    pub new_segment_bytes: u64,
    pub new_last_stream_seq: Option<String>,
    pub close: Option<CloseFields>,
    pub producer_upsert: Option<ProducerRecord>,
}

pub struct CloseFields {
    pub closed_at: i64,
    pub closed_by_producer_id: Option<String>,
    pub closed_by_epoch: Option<u64>,
    pub closed_by_seq: Option<u64>,
}

pub struct Storage {
    conn: Connection,
    location: Location,
}

impl Storage {
    /// Open a private, named in-memory database. The name must be unique
    /// per stream actor (e.g. the stream id) so unrelated streams in the
    /// same process don't share state; `cache=shared` only scopes sharing
    /// to connections that name the same URI.
    pub fn open_in_memory(name: &str) -> Result<Self, EngineError> {
        let uri = memory_uri(name);
        let conn = Connection::open_with_flags(
            &uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Self::init(conn, Location::Memory(name.to_string()))
    }

    pub fn open_file(dir: &Path, stream_id: &str) -> Result<Self, EngineError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::Internal(format!("failed to create data dir: {e}")))?;
        let file_name = crate::path_encoding::encode_path(stream_id);
        let path = dir.join(format!("{file_name}.sqlite3"));
        let conn = Connection::open(&path)?;
        Self::init(conn, Location::File(path))
    }

    /// A second connection onto the same database, for the read path:
    /// reads do not take the critical section and run concurrently against
    /// storage. Only the read-returning methods on [`Storage`] should be
    /// called through this handle; `commit_append_batch` would fail against
    /// a read-only connection.
    pub fn read_only_handle(&self) -> Result<Storage, EngineError> {
        let conn = match &self.location {
            Location::Memory(name) => Connection::open_with_flags(
                memory_uri(name),
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )?,
            Location::File(path) => {
                Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
            }
        };
        conn.execute_batch("PRAGMA query_only=ON;")?;
        Ok(Storage {
            conn,
            location: self.location.clone(),
        })
    }

    fn init(conn: Connection, location: Location) -> Result<Self, EngineError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn, location })
    }

    // -- metadata -----------------------------------------------------

    pub fn load_meta(&self, stream_id: &str) -> Result<Option<StreamMeta>, EngineError> {
        self.conn
            .query_row(
                "SELECT stream_id, content_type, is_public, tail_offset, read_seq,
                        segment_start, segment_messages, segment_bytes, last_stream_seq,
                        ttl_seconds, expires_at, closed, closed_at, closed_by_producer_id,
                        closed_by_epoch, closed_by_seq, created_at
                 FROM stream_meta WHERE stream_id = ?1",
                params![stream_id],
                map_meta,
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn insert_meta(&self, meta: &StreamMeta) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO stream_meta
                (stream_id, content_type, is_public, tail_offset, read_seq, segment_start,
                 segment_messages, segment_bytes, last_stream_seq, ttl_seconds, expires_at,
                 closed, closed_at, closed_by_producer_id, closed_by_epoch, closed_by_seq,
                 created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                meta.stream_id,
                meta.content_type,
                meta.is_public as i64,
                meta.tail_offset as i64,
                meta.read_seq as i64,
                meta.segment_start as i64,
                meta.segment_messages as i64,
                meta.segment_bytes as i64,
                meta.last_stream_seq,
                meta.ttl_seconds.map(|v| v as i64),
                meta.expires_at.map(|v| v.to_rfc3339()),
                meta.closed as i64,
                meta.closed_at.map(|v| v.to_rfc3339()),
                meta.closed_by_producer_id,
                meta.closed_by_epoch.map(|v| v as i64),
                meta.closed_by_seq.map(|v| v as i64),
                meta.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_meta_fields(
        &self,
        stream_id: &str,
        tail_offset: u64,
        segment_messages: u64,
        segment_bytes: u64,
        last_stream_seq: Option<&str>,
        close: Option<&CloseFields>,
    ) -> Result<(), EngineError> {
        if let Some(close) = close {
            self.conn.execute(
                "UPDATE stream_meta SET tail_offset=?2, segment_messages=?3, segment_bytes=?4,
                    last_stream_seq = COALESCE(?5, last_stream_seq), closed=1, closed_at=?6,
                    closed_by_producer_id=?7, closed_by_epoch=?8, closed_by_seq=?9
                 WHERE stream_id=?1",
                params![
                    stream_id,
                    tail_offset as i64,
                    segment_messages as i64,
                    segment_bytes as i64,
                    last_stream_seq,
                    DateTime::<Utc>::from_timestamp_millis(close.closed_at)
                        .unwrap_or_else(Utc::now)
                        .to_rfc3339(),
                    close.closed_by_producer_id,
                    close.closed_by_epoch.map(|v| v as i64),
                    close.closed_by_seq.map(|v| v as i64),
                ],
            )?;
        } else {
            self.conn.execute(
                "UPDATE stream_meta SET tail_offset=?2, segment_messages=?3, segment_bytes=?4,
                    last_stream_seq = COALESCE(?5, last_stream_seq)
                 WHERE stream_id=?1",
                params![
                    stream_id,
                    tail_offset as i64,
                    segment_messages as i64,
                    segment_bytes as i64,
                    last_stream_seq,
                ],
            )?;
        }
        Ok(())
    }

    pub fn advance_rotation(
        &self,
        stream_id: &str,
        new_segment_start: u64,
        new_read_seq: u32,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE stream_meta SET segment_start=?2, read_seq=?3, segment_messages=0, segment_bytes=0
             WHERE stream_id=?1",
            params![stream_id, new_segment_start as i64, new_read_seq as i64],
        )?;
        Ok(())
    }

    // -- producers ------------------------------------------------------

    pub fn get_producer(
        &self,
        stream_id: &str,
        producer_id: &str,
    ) -> Result<Option<ProducerRecord>, EngineError> {
        self.conn
            .query_row(
                "SELECT producer_id, epoch, last_seq, last_offset, last_updated
                 FROM producers WHERE stream_id=?1 AND producer_id=?2",
                params![stream_id, producer_id],
                |row| {
                    Ok(ProducerRecord {
                        producer_id: row.get(0)?,
                        epoch: row.get::<_, i64>(1)? as u64,
                        last_seq: row.get::<_, i64>(2)? as u64,
                        last_offset: row.get::<_, i64>(3)? as u64,
                        last_updated: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn delete_producer(&self, stream_id: &str, producer_id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "DELETE FROM producers WHERE stream_id=?1 AND producer_id=?2",
            params![stream_id, producer_id],
        )?;
        Ok(())
    }

    // -- append batch, all-or-nothing ---------------------------

    pub fn commit_append_batch(
        &mut self,
        stream_id: &str,
        batch: &AppendBatch,
    ) -> Result<(), EngineError> {
        let tx = self.conn.transaction()?;
        for row in &batch.rows {
            tx.execute(
                "INSERT INTO hot_ops
                    (stream_id, start_offset, end_offset, size_bytes, stream_seq,
                     producer_id, producer_epoch, producer_seq, body, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                params![
                    stream_id,
                    row.start_offset as i64,
                    row.end_offset as i64,
                    row.size_bytes as i64,
                    row.stream_seq,
                    row.producer_id,
                    row.producer_epoch.map(|v| v as i64),
                    row.producer_seq.map(|v| v as i64),
                    row.body.as_ref(),
                    row.created_at,
                ],
            )?;
        }

        if let Some(close) = &batch.close {
            tx.execute(
                "UPDATE stream_meta SET tail_offset=?2, segment_messages=?3, segment_bytes=?4,
                    last_stream_seq = COALESCE(?5, last_stream_seq), closed=1, closed_at=?6,
                    closed_by_producer_id=?7, closed_by_epoch=?8, closed_by_seq=?9
                 WHERE stream_id=?1",
                params![
                    stream_id,
                    batch.new_tail_offset as i64,
                    batch.new_segment_messages as i64,
                    batch.new_segment_bytes as i64,
                    batch.new_last_stream_seq,
                    DateTime::<Utc>::from_timestamp_millis(close.closed_at)
                        .unwrap_or_else(Utc::now)
                        .to_rfc3339(),
                    close.closed_by_producer_id,
                    close.closed_by_epoch.map(|v| v as i64),
                    close.closed_by_seq.map(|v| v as i64),
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE stream_meta SET tail_offset=?2, segment_messages=?3, segment_bytes=?4,
                    last_stream_seq = COALESCE(?5, last_stream_seq)
                 WHERE stream_id=?1",
                params![
                    stream_id,
                    batch.new_tail_offset as i64,
                    batch.new_segment_messages as i64,
                    batch.new_segment_bytes as i64,
                    batch.new_last_stream_seq,
                ],
            )?;
        }

        if let Some(p) = &batch.producer_upsert {
            tx.execute(
                "INSERT INTO producers (stream_id, producer_id, epoch, last_seq, last_offset, last_updated)
                 VALUES (?1,?2,?3,?4,?5,?6)
                 ON CONFLICT(stream_id, producer_id) DO UPDATE SET
                    epoch=excluded.epoch, last_seq=excluded.last_seq,
                    last_offset=excluded.last_offset, last_updated=excluded.last_updated",
                params![
                    stream_id,
                    p.producer_id,
                    p.epoch as i64,
                    p.last_seq as i64,
                    p.last_offset as i64,
                    p.last_updated,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // -- hot rows ---------------------------------------------------------

    pub fn hot_rows_from(&self, stream_id: &str, start_offset: u64) -> Result<Vec<HotRow>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT start_offset, end_offset, size_bytes, stream_seq, producer_id,
                    producer_epoch, producer_seq, body, created_at
             FROM hot_ops WHERE stream_id=?1 AND start_offset >= ?2 ORDER BY start_offset ASC",
        )?;
        let rows = stmt
            .query_map(params![stream_id, start_offset as i64], map_hot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn hot_rows_in_range(
        &self,
        stream_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<HotRow>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT start_offset, end_offset, size_bytes, stream_seq, producer_id,
                    producer_epoch, producer_seq, body, created_at
             FROM hot_ops WHERE stream_id=?1 AND start_offset >= ?2 AND start_offset < ?3
             ORDER BY start_offset ASC",
        )?;
        let rows = stmt
            .query_map(params![stream_id, start as i64, end as i64], map_hot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_hot_rows_before(&self, stream_id: &str, offset: u64) -> Result<(), EngineError> {
        self.conn.execute(
            "DELETE FROM hot_ops WHERE stream_id=?1 AND end_offset <= ?2",
            params![stream_id, offset as i64],
        )?;
        Ok(())
    }

    // -- segments -----------------------------------------------------------

    pub fn insert_segment(&self, stream_id: &str, seg: &SegmentRow) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO segments
                (stream_id, read_seq, object_key, start_offset, end_offset, content_type,
                 size_bytes, message_count, expires_at, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                stream_id,
                seg.read_seq as i64,
                seg.object_key,
                seg.start_offset as i64,
                seg.end_offset as i64,
                seg.content_type,
                seg.size_bytes as i64,
                seg.message_count as i64,
                seg.expires_at.map(|v| v.to_rfc3339()),
                seg.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_segment(&self, stream_id: &str, read_seq: u32) -> Result<Option<SegmentRow>, EngineError> {
        self.conn
            .query_row(
                "SELECT read_seq, object_key, start_offset, end_offset, content_type,
                        size_bytes, message_count, expires_at, created_at
                 FROM segments WHERE stream_id=?1 AND read_seq=?2",
                params![stream_id, read_seq as i64],
                map_segment,
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn segment_covering(&self, stream_id: &str, offset: u64) -> Result<Option<SegmentRow>, EngineError> {
        self.conn
            .query_row(
                "SELECT read_seq, object_key, start_offset, end_offset, content_type,
                        size_bytes, message_count, expires_at, created_at
                 FROM segments WHERE stream_id=?1 AND start_offset <= ?2 AND end_offset > ?2",
                params![stream_id, offset as i64],
                map_segment,
            )
            .optional()
            .map_err(EngineError::from)
    }

    pub fn segment_starting_at(&self, stream_id: &str, offset: u64) -> Result<Option<SegmentRow>, EngineError> {
        self.conn
            .query_row(
                "SELECT read_seq, object_key, start_offset, end_offset, content_type,
                        size_bytes, message_count, expires_at, created_at
                 FROM segments WHERE stream_id=?1 AND start_offset = ?2",
                params![stream_id, offset as i64],
                map_segment,
            )
            .optional()
            .map_err(EngineError::from)
    }

    // -- subscribers & fanout state ------------------------------------------

    pub fn add_subscriber(&self, stream_id: &str, estuary_id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO subscribers (stream_id, estuary_id, subscribed_at) VALUES (?1,?2,?3)",
            params![stream_id, estuary_id, Utc::now().timestamp_millis()],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO fanout_state (stream_id, fanout_seq) VALUES (?1, 0)",
            params![stream_id],
        )?;
        Ok(())
    }

    pub fn remove_subscribers(&self, stream_id: &str, estuary_ids: &[String]) -> Result<(), EngineError> {
        for id in estuary_ids {
            self.conn.execute(
                "DELETE FROM subscribers WHERE stream_id=?1 AND estuary_id=?2",
                params![stream_id, id],
            )?;
        }
        Ok(())
    }

    pub fn list_subscribers(&self, stream_id: &str) -> Result<Vec<String>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT estuary_id FROM subscribers WHERE stream_id=?1")?;
        let rows = stmt
            .query_map(params![stream_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns the next `fanout_seq` to dispatch under, then durably advances
    /// it so a crash can only replay that same value, never skip it. The
    /// first delivery to any estuary carries `0`, matching the zero-based
    /// start producer dedup requires for a stream it has never written to.
    pub fn next_fanout_seq(&self, stream_id: &str) -> Result<u64, EngineError> {
        self.conn.execute(
            "INSERT INTO fanout_state (stream_id, fanout_seq) VALUES (?1, 0)
             ON CONFLICT(stream_id) DO NOTHING",
            params![stream_id],
        )?;
        let seq: i64 = self.conn.query_row(
            "SELECT fanout_seq FROM fanout_state WHERE stream_id=?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "UPDATE fanout_state SET fanout_seq = fanout_seq + 1 WHERE stream_id=?1",
            params![stream_id],
        )?;
        Ok(seq as u64)
    }

    // -- lifecycle -----------------------------------------------------------

    pub fn delete_stream(&self, stream_id: &str) -> Result<(), EngineError> {
        self.conn
            .execute("DELETE FROM stream_meta WHERE stream_id=?1", params![stream_id])?;
        self.conn
            .execute("DELETE FROM producers WHERE stream_id=?1", params![stream_id])?;
        self.conn
            .execute("DELETE FROM hot_ops WHERE stream_id=?1", params![stream_id])?;
        self.conn
            .execute("DELETE FROM segments WHERE stream_id=?1", params![stream_id])?;
        self.conn
            .execute("DELETE FROM subscribers WHERE stream_id=?1", params![stream_id])?;
        self.conn
            .execute("DELETE FROM fanout_state WHERE stream_id=?1", params![stream_id])?;
        Ok(())
    }
}

fn memory_uri(name: &str) -> String {
    format!("file:tidelog_{name}?mode=memory&cache=shared")
}

fn map_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreamMeta> {
    let expires_at: Option<String> = row.get(10)?;
    let closed_at: Option<String> = row.get(12)?;
    Ok(StreamMeta {
        stream_id: row.get(0)?,
        content_type: row.get(1)?,
        is_public: row.get::<_, i64>(2)? != 0,
        tail_offset: row.get::<_, i64>(3)? as u64,
        read_seq: row.get::<_, i64>(4)? as u32,
        segment_start: row.get::<_, i64>(5)? as u64,
        segment_messages: row.get::<_, i64>(6)? as u64,
        segment_bytes: row.get::<_, i64>(7)? as u64,
        last_stream_seq: row.get(8)?,
        ttl_seconds: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        expires_at: expires_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        closed: row.get::<_, i64>(11)? != 0,
        closed_at: closed_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        closed_by_producer_id: row.get(13)?,
        closed_by_epoch: row.get::<_, Option<i64>>(14)?.map(|v| v as u64),
        closed_by_seq: row.get::<_, Option<i64>>(15)?.map(|v| v as u64),
        created_at: row.get(16)?,
    })
}

fn map_hot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HotRow> {
    let body: Vec<u8> = row.get(7)?;
    Ok(HotRow {
        start_offset: row.get::<_, i64>(0)? as u64,
        end_offset: row.get::<_, i64>(1)? as u64,
        size_bytes: row.get::<_, i64>(2)? as u64,
        stream_seq: row.get(3)?,
        producer_id: row.get(4)?,
        producer_epoch: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        producer_seq: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        body: Bytes::from(body),
        created_at: row.get(8)?,
    })
}

fn map_segment(row: &rusqlite::Row<'_>) -> rusqlite::Result<SegmentRow> {
    let expires_at: Option<String> = row.get(7)?;
    Ok(SegmentRow {
        read_seq: row.get::<_, i64>(0)? as u32,
        object_key: row.get(1)?,
        start_offset: row.get::<_, i64>(2)? as u64,
        end_offset: row.get::<_, i64>(3)? as u64,
        content_type: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        message_count: row.get::<_, i64>(6)? as u64,
        expires_at: expires_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_meta(stream_id: &str) -> StreamMeta {
        StreamMeta {
            stream_id: stream_id.to_string(),
            content_type: Some("text/plain".to_string()),
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

    #[test]
    fn insert_and_load_meta_round_trips() {
        let storage = Storage::open_in_memory("t1").unwrap();
        storage.insert_meta(&fresh_meta("s1")).unwrap();
        let loaded = storage.load_meta("s1").unwrap().unwrap();
        assert_eq!(loaded.stream_id, "s1");
        assert_eq!(loaded.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn lookup_compares_the_key_not_a_singleton_row() {
        let storage = Storage::open_in_memory("t2").unwrap();
        storage.insert_meta(&fresh_meta("a")).unwrap();
        storage.insert_meta(&fresh_meta("b")).unwrap();
        assert!(storage.load_meta("a").unwrap().is_some());
        assert!(storage.load_meta("missing").unwrap().is_none());
    }

    #[test]
    fn append_batch_is_atomic() {
        let mut storage = Storage::open_in_memory("t3").unwrap();
        storage.insert_meta(&fresh_meta("s1")).unwrap();
        let batch = AppendBatch {
            rows: vec![HotRow {
                start_offset: 0,
                end_offset: 5,
                size_bytes: 5,
                stream_seq: None,
                producer_id: None,
                producer_epoch: None,
                producer_seq: None,
                body: Bytes::from_static(b"hello"),
                created_at: Utc::now().timestamp_millis(),
            }],
            new_tail_offset: 5,
            new_segment_messages: 1,
            new_segment_bytes: 5,
            new_last_stream_seq: None,
            close: None,
            producer_upsert: None,
        };
        storage.commit_append_batch("s1", &batch).unwrap();
        let meta = storage.load_meta("s1").unwrap().unwrap();
        assert_eq!(meta.tail_offset, 5);
        let rows = storage.hot_rows_from("s1", 0).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn fanout_seq_starts_at_zero_and_is_durable() {
        let storage = Storage::open_in_memory("t4").unwrap();
        assert_eq!(storage.next_fanout_seq("s1").unwrap(), 0);
        assert_eq!(storage.next_fanout_seq("s1").unwrap(), 1);
        assert_eq!(storage.next_fanout_seq("s2").unwrap(), 0);
    }
}
