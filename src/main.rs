use dist_cache::config::EngineConfig;
use dist_cache::coordination::{CoordinationClient, EtcdCoordinationClient, InMemoryCoordinationClient};
use dist_cache::engine::CacheEngine;
use dist_cache::metrics::TracingMetricsSink;
use dist_cache::store::InMemoryStore;
use dist_cache::transport::PeerServer;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dist_cache=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(node_id = %config.node_id, "configuration loaded");

    let store = Arc::new(InMemoryStore::new());
    store.spawn_expiration_task();

    let coordination: Arc<dyn CoordinationClient> =
        match EtcdCoordinationClient::connect(&config.coordination_endpoints).await {
            Ok(client) => {
                tracing::info!(endpoints = ?config.coordination_endpoints, "connected to etcd");
                Arc::new(client)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "coordination service unreachable at boot, proceeding in single-node degraded mode"
                );
                Arc::new(InMemoryCoordinationClient::new())
            }
        };

    let (engine, peer_context) = CacheEngine::start(
        config.clone(),
        store,
        coordination.clone(),
        Arc::new(TracingMetricsSink),
    )
    .await;

    let peer_addr = format!("0.0.0.0:{}", config.peer_port);
    let peer_server = PeerServer::bind(&peer_addr, peer_context).await?;
    tracing::info!(addr = %peer_addr, "peer rpc listening");
    let peer_task = tokio::spawn(peer_server.run());

    tracing::info!(node_id = %config.node_id, "cache engine ready");

    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }

    peer_task.abort();
    if let Err(e) = coordination.unregister(&config.node_id).await {
        tracing::warn!(error = %e, "failed to unregister from coordination on shutdown");
    }
    tracing::info!(healthy = engine.healthy(), "engine stopped");

    Ok(())
}
