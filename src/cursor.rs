//! Rolling cursor for live delivery.
//!
//! Time is divided into fixed intervals; the cursor is the number of
//! intervals elapsed since a fixed epoch. This gives CDN-fronted long-poll
//! and SSE responses a value that changes at interval boundaries instead of
//! every request, while still guaranteeing the cursor a caller is handed
//! back is never smaller than the one it sent in.

use chrono::Utc;
use rand::Rng;

use crate::config::EngineConfig;

/// Number of intervals elapsed since `config.cursor_epoch`.
pub fn current_interval(config: &EngineConfig) -> u64 {
    let elapsed = Utc::now()
        .signed_duration_since(config.cursor_epoch)
        .num_seconds()
        .max(0) as u64;
    elapsed / config.cursor_interval_seconds
}

/// Pick the cursor to hand back to a caller, given the one it sent.
///
/// A client cursor already at or past the current interval would otherwise
/// receive the same value on every poll, which a CDN would cache forever.
/// Jitter forward in that case; a client behind the current interval just
/// catches up to it.
pub fn next_cursor(client_cursor: Option<u64>, config: &EngineConfig) -> u64 {
    let current = current_interval(config);

    match client_cursor {
        Some(cursor) if cursor >= current => {
            let jitter_seconds: u64 = rand::thread_rng().gen_range(1..=3600);
            let jitter_intervals = (jitter_seconds / config.cursor_interval_seconds).max(1);
            cursor + jitter_intervals
        }
        Some(cursor) => current.max(cursor),
        None => current,
    }
}

pub fn parse_cursor(cursor: &str) -> Option<u64> {
    cursor.parse().ok()
}
