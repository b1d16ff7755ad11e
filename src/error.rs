//! Engine failure taxonomy.
//!
//! These are the only errors that cross the engine's public boundary.
//! Storage/object-store/queue failures are caught at the policy boundary
//! (retry, abort-rotation, queue-redelivery) and never surface here except
//! as [`EngineError::Internal`].

use thiserror::Error;

/// Failure kinds produced by stream engine operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("stream not found")]
    NotFound,

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("stream is closed")]
    ClosedConflict,

    #[error("bad request: {detail}")]
    BadRequest { detail: String },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("invalid offset")]
    InvalidOffset,

    #[error("offset beyond tail")]
    OffsetBeyondTail,

    #[error("stream-seq regression")]
    SeqRegression,

    #[error("stale producer epoch, current epoch is {current_epoch}")]
    StaleEpoch { current_epoch: u64 },

    #[error("sequence gap: expected {expected}, received {received}")]
    SeqGap { expected: u64, received: u64 },

    #[error("cold segment unavailable")]
    SegmentUnavailable,

    #[error("cold segment truncated")]
    SegmentTruncated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Maps this error onto the transport-agnostic HTTP status code contract in
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::NotFound => 404,
            EngineError::Conflict { .. } => 409,
            EngineError::ClosedConflict => 409,
            EngineError::BadRequest { .. } => 400,
            EngineError::PayloadTooLarge => 413,
            EngineError::QuotaExceeded => 507,
            EngineError::InvalidOffset | EngineError::OffsetBeyondTail => 400,
            EngineError::SeqRegression => 409,
            EngineError::StaleEpoch { .. } => 409,
            EngineError::SeqGap { .. } => 409,
            EngineError::SegmentUnavailable | EngineError::SegmentTruncated => 500,
            EngineError::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("storage error: {e}"))
    }
}
