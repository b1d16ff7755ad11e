//! Object store collaborator.
//!
//! Cold segments are namespaced `stream/<stream_id>/<read_seq>.seg` and
//! never rewritten once put. The engine is generic over this trait so tests
//! run against [`InMemoryObjectStore`] without any real blob service.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Build the stable cold-segment key for a stream/read_seq pair.
pub fn segment_key(stream_id: &str, read_seq: u32) -> String {
    format!("stream/{stream_id}/{read_seq}.seg")
}

/// In-memory test double; also useful for a single-node deployment with no
/// external blob service.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: parking_lot::RwLock<std::collections::HashMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), ObjectStoreError> {
        self.objects.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryObjectStore::new();
        store.put("k", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = InMemoryObjectStore::new();
        assert!(matches!(
            store.get("missing").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[test]
    fn segment_key_matches_the_documented_layout() {
        assert_eq!(segment_key("proj1/s", 3), "stream/proj1/s/3.seg");
    }
}
