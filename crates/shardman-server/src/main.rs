//! shardman coordinator entrypoint.

use std::sync::Arc;

use shardman_core::store::EtcdStore;
use shardman_server::EventQueue;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let etcd_endpoints = std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.to_string())
        .collect::<Vec<_>>();

    let node_id = std::env::var("NODE_ID")
        .unwrap_or_else(|_| format!("sm-server-{}", uuid::Uuid::new_v4()));

    info!("Node ID: {}", node_id);
    info!("Etcd endpoints: {:?}", etcd_endpoints);

    info!("Connecting to etcd...");
    let store = Arc::new(EtcdStore::connect(etcd_endpoints).await?);
    info!("Connected to etcd");

    let cancel = CancellationToken::new();
    let queue = EventQueue::new(store, cancel.clone());
    info!("Event queue running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    drop(queue);

    Ok(())
}
