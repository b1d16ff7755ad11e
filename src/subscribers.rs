//! Estuary-wide subscriber store collaborator: the cross-node metadata
//! store backing each stream's subscription list.
//!
//! The engine keeps its own copy of a stream's subscriber set in
//! [`crate::storage::Storage`] for durability; this trait is the external
//! system of record that the fanout pipeline prunes on stale delivery
//! and that a real deployment would use for cross-node
//! discovery.

pub trait SubscriberStore: Send + Sync {
    async fn subscribers_of(&self, stream_id: &str) -> Vec<String>;
    async fn remove_subscribers(&self, stream_id: &str, estuary_ids: &[String]);
}

#[derive(Default)]
pub struct InMemorySubscriberStore {
    subs: parking_lot::RwLock<std::collections::HashMap<String, Vec<String>>>,
}

impl InMemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stream_id: &str, estuary_id: &str) {
        let mut subs = self.subs.write();
        let list = subs.entry(stream_id.to_string()).or_default();
        if !list.iter().any(|id| id == estuary_id) {
            list.push(estuary_id.to_string());
        }
    }
}

impl SubscriberStore for InMemorySubscriberStore {
    async fn subscribers_of(&self, stream_id: &str) -> Vec<String> {
        self.subs.read().get(stream_id).cloned().unwrap_or_default()
    }

    async fn remove_subscribers(&self, stream_id: &str, estuary_ids: &[String]) {
        if let Some(list) = self.subs.write().get_mut(stream_id) {
            list.retain(|id| !estuary_ids.contains(id));
        }
    }
}
