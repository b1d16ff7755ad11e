//! Cold segment wire format.
//!
//! A simple length-prefixed sequence of records preserving original
//! offsets: `[8-byte BE start_offset][4-byte BE body_len][body]`, repeated.
//! Bytes for a given `read_seq` never change once written, so this layout
//! only needs to support append-once-encode, seek-decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One decoded record from a cold segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub start_offset: u64,
    pub body: Bytes,
}

/// Result of decoding a segment, possibly truncated by a byte budget or by
/// corrupt trailing bytes.
#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub records: Vec<SegmentRecord>,
    pub truncated: bool,
}

/// Encode hot rows (as `(start_offset, body)` pairs) into a segment blob.
pub fn encode(rows: &[(u64, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (start_offset, body) in rows {
        buf.put_u64(*start_offset);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
    }
    buf.freeze()
}

/// Decode a segment, starting emission at the first record whose
/// `start_offset >= requested_offset`, bounded by `max_bytes` of body data.
/// Reports `truncated = true` if the segment bytes end mid-record.
pub fn decode_from_offset(blob: &[u8], requested_offset: u64, max_bytes: usize) -> DecodeResult {
    let mut cursor = blob;
    let mut records = Vec::new();
    let mut truncated = false;
    let mut emitted_bytes = 0usize;

    loop {
        if cursor.is_empty() {
            break;
        }
        if cursor.len() < 12 {
            // Not enough bytes for a full header.
            truncated = true;
            break;
        }
        let start_offset = (&cursor[0..8]).get_u64();
        let body_len = (&cursor[8..12]).get_u32() as usize;
        if cursor.len() < 12 + body_len {
            truncated = true;
            break;
        }
        let body = Bytes::copy_from_slice(&cursor[12..12 + body_len]);
        cursor = &cursor[12 + body_len..];

        if start_offset < requested_offset {
            continue;
        }
        if emitted_bytes >= max_bytes && !records.is_empty() {
            break;
        }
        emitted_bytes += body.len();
        records.push(SegmentRecord { start_offset, body });
        if emitted_bytes >= max_bytes {
            break;
        }
    }

    DecodeResult { records, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<(u64, Bytes)> {
        vec![
            (0, Bytes::from_static(b"A")),
            (1, Bytes::from_static(b"B")),
            (2, Bytes::from_static(b"C")),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        let blob = encode(&rows());
        let result = decode_from_offset(&blob, 0, 1024);
        assert!(!result.truncated);
        assert_eq!(result.records.len(), 3);
        assert_eq!(result.records[0].body, Bytes::from_static(b"A"));
    }

    #[test]
    fn seeks_past_earlier_records() {
        let blob = encode(&rows());
        let result = decode_from_offset(&blob, 2, 1024);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].start_offset, 2);
    }

    #[test]
    fn reports_truncation_on_partial_trailing_record() {
        let blob = encode(&rows());
        let mut truncated_blob = blob.to_vec();
        truncated_blob.truncate(blob.len() - 1);
        let result = decode_from_offset(&truncated_blob, 0, 1024);
        assert!(result.truncated);
        // First two full records still decode.
        assert_eq!(result.records.len(), 2);
    }

    #[test]
    fn byte_budget_stops_emission_but_includes_first_record() {
        let blob = encode(&rows());
        let result = decode_from_offset(&blob, 0, 0);
        // Never emit zero records if data exists past the requested offset;
        // the caller's budget governs truncation of subsequent records only.
        assert_eq!(result.records.len(), 1);
        assert!(!result.truncated);
    }
}
