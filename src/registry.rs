//! Registry collaborator: a key-value metadata mirror for cross-node
//! discovery. The engine only ever deletes a key here, on stream delete,
//! with up to 3 retries at linear backoff.

pub trait Registry: Send + Sync {
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("registry unavailable: {0}")]
pub struct RegistryError(pub String);

#[derive(Default)]
pub struct InMemoryRegistry {
    keys: parking_lot::RwLock<std::collections::HashSet<String>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str) {
        self.keys.write().insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.read().contains(key)
    }
}

impl Registry for InMemoryRegistry {
    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        self.keys.write().remove(key);
        Ok(())
    }
}

/// Best-effort registry cleanup with linear backoff: up to 3
/// attempts, failures are swallowed since this is a cross-node mirror, not
/// the source of truth.
pub async fn cleanup_with_retry<R: Registry>(registry: &R, key: &str) {
    for attempt in 0..3u32 {
        if registry.delete(key).await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100 * (attempt as u64 + 1))).await;
    }
    tracing::warn!(key, "registry cleanup failed after retries, giving up");
}
