//! Engine-wide tunables.
//!
//! One struct passed down by reference rather than read from globals, so
//! every stream actor and the HTTP layer above it share the same rotation,
//! quota, and timeout limits.

use chrono::{DateTime, Utc};

/// Configuration shared by every stream actor a [`crate::Broker`] manages.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Caps the body of any single read response.
    pub max_chunk_bytes: usize,
    /// Caps any single write payload.
    pub max_append_bytes: usize,
    /// Per-stream hot-storage budget; writes are rejected at 90% utilization.
    pub storage_quota_bytes: u64,
    /// Fraction of `storage_quota_bytes` at which writes are rejected.
    pub quota_reject_fraction: f64,
    /// Rotate hot rows to a cold segment once this many messages accumulate.
    pub rotation_max_messages: u64,
    /// Rotate hot rows to a cold segment once this many bytes accumulate.
    pub rotation_max_bytes: u64,
    /// Delete hot rows after they are folded into a cold segment.
    pub delete_hot_rows_after_rotation: bool,
    /// Subscriber-count threshold below which fanout dispatches inline.
    pub fanout_inline_threshold: usize,
    /// Long-poll wait ceiling when the caller does not specify one.
    pub default_long_poll_timeout_ms: u64,
    /// Window over which ready long-poll waiters are woken, spread out.
    pub long_poll_stagger_ms: u64,
    /// How long a coalesced read result stays cached after completion.
    pub read_cache_ttl_ms: u64,
    /// Bound on the in-flight and cache maps used by read coalescing.
    pub read_coalesce_capacity: usize,
    /// A producer record older than this is purged on next lookup.
    pub producer_ttl: chrono::Duration,
    /// Cursor rotation interval (CDN cache-collision avoidance).
    pub cursor_interval_seconds: u64,
    /// Epoch the cursor interval count is measured from.
    pub cursor_epoch: DateTime<Utc>,
    /// Directory for file-backed SQLite storage; `None` uses `:memory:`.
    pub data_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 1024 * 1024,
            max_append_bytes: 4 * 1024 * 1024,
            storage_quota_bytes: 256 * 1024 * 1024,
            quota_reject_fraction: 0.90,
            rotation_max_messages: 10_000,
            rotation_max_bytes: 8 * 1024 * 1024,
            delete_hot_rows_after_rotation: true,
            fanout_inline_threshold: 16,
            default_long_poll_timeout_ms: 30_000,
            long_poll_stagger_ms: 250,
            read_cache_ttl_ms: 100,
            read_coalesce_capacity: 1000,
            producer_ttl: chrono::Duration::days(7),
            cursor_interval_seconds: 20,
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            data_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn quota_reject_threshold_bytes(&self) -> u64 {
        (self.storage_quota_bytes as f64 * self.quota_reject_fraction) as u64
    }
}
