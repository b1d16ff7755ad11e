//! Live delivery: long-poll waiter queue with pre-cache, and push broadcast
//! to connected subscribers.
//!
//! A standalone per-stream collaborator the engine owns, rather than
//! notification state baked directly into storage.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

/// One long-poll request waiting for data past `offset`.
struct Waiter {
    offset: u64,
    request_url: Option<String>,
    resolve: oneshot::Sender<()>,
}

/// Per-stream long-poll waiter queue.
pub struct WaiterQueue {
    waiters: Mutex<Vec<Waiter>>,
}

impl Default for WaiterQueue {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and wait. Resolves `false` if woken by `notify`/`notify_all`
    /// before `timeout_ms` elapses, `true` on timeout.
    pub async fn wait(&self, offset: u64, request_url: Option<String>, timeout_ms: u64) -> bool {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(Waiter {
            offset,
            request_url,
            resolve: tx,
        });
        tokio::time::timeout(Duration::from_millis(timeout_ms), rx)
            .await
            .is_err()
    }

    /// Snapshot the request URLs of waiters that `new_tail` would satisfy,
    /// deduplicated. Used for pre-cache before the commit that produces
    /// `new_tail` actually lands.
    pub fn ready_waiter_urls(&self, new_tail: u64) -> Vec<String> {
        let waiters = self.waiters.lock();
        let mut seen = std::collections::HashSet::new();
        waiters
            .iter()
            .filter(|w| w.offset < new_tail)
            .filter_map(|w| w.request_url.clone())
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    /// Wake waiters with `offset < new_tail`. The first one fires
    /// immediately (the "scout"); the rest are spread linearly across
    /// `stagger_ms` so a broadcast doesn't send every reader back to
    /// storage in the same instant.
    pub fn notify(&self, new_tail: u64, stagger_ms: u64) {
        let ready: Vec<Waiter> = {
            let mut waiters = self.waiters.lock();
            let (ready, remaining): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|w| w.offset < new_tail);
            *waiters = remaining;
            ready
        };
        if ready.is_empty() {
            return;
        }
        let count = ready.len() as u64;
        for (i, waiter) in ready.into_iter().enumerate() {
            if i == 0 {
                let _ = waiter.resolve.send(());
                continue;
            }
            let delay_ms = stagger_ms * i as u64 / count.max(1);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = waiter.resolve.send(());
            });
        }
    }

    /// Wake every waiter regardless of offset (delete/close).
    pub fn notify_all(&self) {
        let waiters: Vec<Waiter> = self.waiters.lock().drain(..).collect();
        for waiter in waiters {
            let _ = waiter.resolve.send(());
        }
    }
}

/// Process-local response cache keyed by request URL, pre-rendering a
/// long-poll body before the waiter it's meant for wakes up. Bounded by TTL
/// rather than kept as unbounded ambient global state.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, (Bytes, Instant)>>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    pub fn put(&self, url: &str, body: Bytes) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(url) {
            return;
        }
        entries.insert(url.to_string(), (body, Instant::now()));
    }

    pub fn take(&self, url: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.get(url) {
            Some((body, put_at)) if put_at.elapsed() <= self.ttl => {
                let body = body.clone();
                entries.remove(url);
                Some(body)
            }
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        }
    }
}

/// One event pushed to a live-connected subscriber (SSE / socket).
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    Data { body: Bytes },
    Control {
        next_offset: String,
        up_to_date: bool,
        closed: Option<bool>,
        write_timestamp: Option<i64>,
        cursor: u64,
    },
}

/// Per-stream broadcast of [`DeliveryEvent`]s to connected subscribers.
/// A failing send only disconnects that one receiver; it never propagates.
pub struct Broadcaster {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget; `Err` only means no receivers are connected.
    pub fn publish(&self, event: DeliveryEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_only_waiters_behind_the_new_tail() {
        let queue = WaiterQueue::new();
        let behind = queue.wait(0, None, 5_000);
        let ahead = queue.wait(10, None, 50);
        queue.notify(5, 10);
        assert!(!behind.await);
        assert!(ahead.await);
    }

    #[tokio::test]
    async fn timeout_resolves_true_with_no_notify() {
        let queue = WaiterQueue::new();
        assert!(queue.wait(0, None, 10).await);
    }

    #[tokio::test]
    async fn notify_all_wakes_regardless_of_offset() {
        let queue = WaiterQueue::new();
        let waiting = queue.wait(1_000_000, None, 5_000);
        queue.notify_all();
        assert!(!waiting.await);
    }

    #[test]
    fn ready_waiter_urls_are_deduplicated() {
        let queue = WaiterQueue::new();
        queue.waiters.lock().push(Waiter {
            offset: 0,
            request_url: Some("u1".to_string()),
            resolve: oneshot::channel().0,
        });
        queue.waiters.lock().push(Waiter {
            offset: 0,
            request_url: Some("u1".to_string()),
            resolve: oneshot::channel().0,
        });
        assert_eq!(queue.ready_waiter_urls(10), vec!["u1".to_string()]);
    }

    #[test]
    fn cache_entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(0), 10);
        cache.put("u", Bytes::from_static(b"x"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.take("u"), None);
    }

    #[test]
    fn cache_hit_returns_the_stored_body_once() {
        let cache = ResponseCache::new(Duration::from_secs(1), 10);
        cache.put("u", Bytes::from_static(b"x"));
        assert_eq!(cache.take("u"), Some(Bytes::from_static(b"x")));
        assert_eq!(cache.take("u"), None);
    }

    #[test]
    fn broadcast_publish_without_receivers_does_not_panic() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(DeliveryEvent::Data {
            body: Bytes::from_static(b"x"),
        });
    }
}
