//! Offset codec: the opaque two-part `(read_seq, position_within_segment)` token.
//!
//! The wire form is a pair of 16-digit zero-padded decimal numbers joined by
//! `_`, e.g. `0000000000000000_0000000000001024`. This is lexicographically
//! ordered by construction: the pair uniquely identifies a position in the
//! full stream even across rotations.

use crate::error::EngineError;

/// A decoded opaque offset: `(read_seq, position_within_segment)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Offset {
    pub read_seq: u64,
    pub position: u64,
}

impl Offset {
    pub const ZERO: Offset = Offset {
        read_seq: 0,
        position: 0,
    };

    pub fn new(read_seq: u64, position: u64) -> Self {
        Self { read_seq, position }
    }

    /// Encode to the opaque wire string.
    pub fn encode(&self) -> String {
        format!("{:016}_{:016}", self.read_seq, self.position)
    }

    /// Decode from the opaque wire string.
    pub fn decode(s: &str) -> Result<Offset, EngineError> {
        let mut parts = s.split('_');
        let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(EngineError::InvalidOffset);
        };
        let read_seq: u64 = a.parse().map_err(|_| EngineError::InvalidOffset)?;
        let position: u64 = b.parse().map_err(|_| EngineError::InvalidOffset)?;
        Ok(Offset { read_seq, position })
    }
}

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}
