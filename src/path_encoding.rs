//! Stream-id encoding for filesystem-safe SQLite file names.
//!
//! A stream id is an opaque `project_id/stream_id` path and may contain
//! characters unsafe for a filename. It is encoded with base64url (RFC 4648);
//! ids long enough to risk hitting filesystem name-length limits are
//! truncated with a hash suffix, trading decodability for a bounded name.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

const MAX_NAME_LENGTH: usize = 200;
const TRUNCATE_LENGTH: usize = 180;
const HASH_PREFIX_LENGTH: usize = 16;

/// Encode a stream id to a filesystem-safe string.
pub fn encode_path(stream_id: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(stream_id.as_bytes());

    if encoded.len() > MAX_NAME_LENGTH {
        let hash = compute_hash(stream_id);
        let truncated = &encoded[..TRUNCATE_LENGTH];
        format!("{}~{}", truncated, &hash[..HASH_PREFIX_LENGTH])
    } else {
        encoded
    }
}

/// Decode a filesystem-safe string back to a stream id.
///
/// Truncated encodings cannot be recovered and return `None`.
pub fn decode_path(encoded: &str) -> Option<String> {
    if encoded.contains('~') {
        return None;
    }
    URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
