//! Size/quota checks that pair with the offset codec, generalized with the
//! checks an append's preflight step requires beyond content-type
//! normalization.

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Normalize a content type by stripping charset/parameters and trimming.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Reject a write payload larger than `max_append_bytes`.
pub fn check_append_size(config: &EngineConfig, len: usize) -> Result<(), EngineError> {
    if len > config.max_append_bytes {
        return Err(EngineError::PayloadTooLarge);
    }
    Ok(())
}

/// Reject a write once hot-storage usage is at or above the configured
/// rejection threshold (90% of quota by default), leaving room for rotation
/// to reclaim space.
pub fn check_quota(config: &EngineConfig, current_segment_bytes: u64) -> Result<(), EngineError> {
    if current_segment_bytes >= config.quota_reject_threshold_bytes() {
        return Err(EngineError::QuotaExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_charset_and_case() {
        assert_eq!(
            normalize_content_type("Application/JSON; charset=utf-8"),
            "application/json"
        );
        assert_eq!(normalize_content_type("  text/plain  "), "text/plain");
    }

    #[test]
    fn quota_rejects_at_ninety_percent() {
        let config = EngineConfig {
            storage_quota_bytes: 100,
            quota_reject_fraction: 0.9,
            ..Default::default()
        };
        assert!(check_quota(&config, 89).is_ok());
        assert!(check_quota(&config, 90).is_err());
    }
}
