//! Demo binary wiring a [`Broker`] to the HTTP front door.
//!
//! Uses the in-memory collaborators unless `TIDELOG_DATA_DIR` is set, in
//! which case storage is file-backed and streams survive a restart. The
//! expiry sweep and fanout queue drain both run on their own interval loop
//! rather than inline with request handling.

use std::sync::Arc;
use std::time::Duration;

use tidelog::config::EngineConfig;
use tidelog::http::{create_router, AppState};
use tidelog::objectstore::InMemoryObjectStore;
use tidelog::queue::InMemoryQueue;
use tidelog::registry::InMemoryRegistry;
use tidelog::subscribers::InMemorySubscriberStore;
use tidelog::Broker;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("tidelog=info".parse().unwrap()))
        .init();

    let host = std::env::var("TIDELOG_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("TIDELOG_PORT").unwrap_or_else(|_| "4000".to_string());
    let data_dir = std::env::var("TIDELOG_DATA_DIR").ok();

    let config = EngineConfig {
        data_dir,
        ..EngineConfig::default()
    };

    let broker = Broker::new(
        config,
        Some(Arc::new(InMemoryObjectStore::new())),
        Arc::new(InMemoryQueue::new()),
        Arc::new(InMemorySubscriberStore::new()),
        Arc::new(InMemoryRegistry::new()),
    );

    spawn_housekeeping(broker.clone());

    let router = create_router(AppState { broker });
    let addr = format!("{host}:{port}");
    tracing::info!(addr, "starting tidelog broker");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await
}

/// Periodically sweeps expired streams and drains the fanout queue.
/// A real deployment would run several consumer loops against a shared
/// durable queue; this binary runs exactly one.
fn spawn_housekeeping(
    broker: Arc<Broker<InMemoryObjectStore, InMemoryQueue, InMemorySubscriberStore, InMemoryRegistry>>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            broker.sweep_expired().await;
            let processed = broker.drain_fanout_queue().await;
            if processed > 0 {
                tracing::debug!(processed, "drained queued fanout messages");
            }
        }
    });
}
