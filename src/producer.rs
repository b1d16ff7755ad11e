//! Producer idempotency and sequence enforcement.
//!
//! A write carries an optional `(producer_id, epoch, seq)` triple. The
//! engine keeps one record per producer per stream and classifies each
//! incoming triple against it before the write is allowed to land.

use chrono::Utc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::storage::ProducerRecord;

/// What the engine should do with an incoming write, given the producer
/// record (if any) already on file for this stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerDecision {
    /// No triple supplied; the write is unconditional.
    NoTriple,
    /// First time this producer has written to this stream (or its epoch
    /// just advanced): accept and start sequencing at this triple.
    FirstWrite,
    /// `seq` is exactly one past the last-seen seq for this epoch: accept.
    NextInSequence,
    /// Same `(producer_id, epoch, seq)` as the last accepted write (or a
    /// seq at or behind last-seen in a fresh/new epoch start): replay,
    /// return the prior outcome instead of writing again.
    DuplicateReplay { prior_offset: u64 },
    /// `epoch` is behind the one on record.
    StaleEpoch { current_epoch: u64 },
    /// `seq` skips ahead of the expected next value.
    SeqGap { expected: u64, received: u64 },
    /// First observed write for a producer (or the first after an epoch
    /// bump) must start at `seq == 0`.
    BadRequestNonZeroStart,
}

/// Evaluate an incoming producer triple against `existing` (purged of
/// expired records by the caller via [`is_expired`]).
pub fn evaluate(
    existing: Option<&ProducerRecord>,
    epoch: u64,
    seq: u64,
) -> ProducerDecision {
    let Some(record) = existing else {
        return if seq == 0 {
            ProducerDecision::FirstWrite
        } else {
            ProducerDecision::BadRequestNonZeroStart
        };
    };

    if epoch < record.epoch {
        return ProducerDecision::StaleEpoch {
            current_epoch: record.epoch,
        };
    }

    if epoch > record.epoch {
        return if seq == 0 {
            ProducerDecision::FirstWrite
        } else {
            ProducerDecision::BadRequestNonZeroStart
        };
    }

    if seq <= record.last_seq {
        return ProducerDecision::DuplicateReplay {
            prior_offset: record.last_offset,
        };
    }

    if seq == record.last_seq + 1 {
        return ProducerDecision::NextInSequence;
    }

    ProducerDecision::SeqGap {
        expected: record.last_seq + 1,
        received: seq,
    }
}

/// A producer record untouched for longer than [`EngineConfig::producer_ttl`]
/// is treated as absent: the next write from that producer starts fresh.
pub fn is_expired(record: &ProducerRecord, config: &EngineConfig) -> bool {
    let last_updated = chrono::DateTime::from_timestamp_millis(record.last_updated)
        .unwrap_or_else(Utc::now);
    Utc::now() - last_updated > config.producer_ttl
}

/// Turn a non-accepting [`ProducerDecision`] into the error specifies.
/// Returns `None` for decisions the caller should proceed to write under
/// (`NoTriple`, `FirstWrite`, `NextInSequence`) or handle specially
/// (`DuplicateReplay`).
pub fn decision_error(decision: &ProducerDecision) -> Option<EngineError> {
    match decision {
        ProducerDecision::StaleEpoch { current_epoch } => Some(EngineError::StaleEpoch {
            current_epoch: *current_epoch,
        }),
        ProducerDecision::SeqGap { expected, received } => Some(EngineError::SeqGap {
            expected: *expected,
            received: *received,
        }),
        ProducerDecision::BadRequestNonZeroStart => Some(EngineError::BadRequest {
            detail: "producer sequence must start at 0".to_string(),
        }),
        _ => None,
    }
}
