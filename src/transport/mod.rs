mod client;
mod server;
mod wire;

pub use client::PeerClient;
pub use server::PeerServer;
pub use wire::{Frame, HealthReq, HealthResp, InvalidateReq, ReplicateReq, RpcResponse};

use crate::config::EngineConfig;
use crate::error::TransportError;
use crate::hash_ring::NodeId;
use crate::store::LocalStore;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Typed, retrying, timeout-bounded RPC to peers (C4): maintains one cached
/// [`PeerClient`] per live peer and fans out Replicate/Invalidate calls
/// concurrently across all of them.
pub struct PeerTransport {
    clients: DashMap<NodeId, Arc<PeerClient>>,
    self_id: NodeId,
    peer_rpc_deadline: Duration,
    max_retries: u32,
    retry_backoff_base: Duration,
}

impl PeerTransport {
    pub fn new(config: &EngineConfig) -> Self {
        PeerTransport {
            clients: DashMap::new(),
            self_id: NodeId(config.node_id.clone()),
            peer_rpc_deadline: config.peer_rpc_deadline,
            max_retries: config.max_peer_retries,
            retry_backoff_base: config.retry_backoff_base,
        }
    }

    /// Register a reachable peer, lazily creating its client on first use.
    /// A no-op for the local node itself — it is never added as a peer.
    pub fn add_peer(&self, node_id: NodeId, host: String, peer_port: u16) {
        if node_id == self.self_id {
            return;
        }
        self.clients.entry(node_id.clone()).or_insert_with(|| {
            Arc::new(PeerClient::new(
                node_id,
                host,
                peer_port,
                self.peer_rpc_deadline,
                self.max_retries,
                self.retry_backoff_base,
            ))
        });
    }

    /// Drop the cached client for a peer that left membership.
    pub fn remove_peer(&self, node_id: &NodeId) {
        self.clients.remove(node_id);
    }

    pub fn connected_peer_count(&self) -> usize {
        self.clients.len()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.clients.iter().map(|e| e.key().clone()).collect()
    }

    fn client_for(&self, node_id: &NodeId) -> Result<Arc<PeerClient>, TransportError> {
        self.clients
            .get(node_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TransportError::UnknownPeer(node_id.to_string()))
    }

    /// Write an envelope directly into a peer's local store (the §4.5.1
    /// SET-path optimization: a direct store write rather than a full
    /// Replicate round for the primary replica set).
    pub async fn direct_set(
        &self,
        node_id: &NodeId,
        key: &str,
        envelope_bytes: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), TransportError> {
        let client = self.client_for(node_id)?;
        client.replicate(key, envelope_bytes, ttl, &self.self_id).await.map(|_| ())
    }

    /// Read the raw local-store bytes a peer holds for `key`.
    pub async fn direct_get(&self, node_id: &NodeId, key: &str) -> Result<Option<Bytes>, TransportError> {
        let client = self.client_for(node_id)?;
        client.fetch(key).await
    }

    pub async fn direct_delete(&self, node_id: &NodeId, key: &str) -> Result<(), TransportError> {
        let client = self.client_for(node_id)?;
        client.invalidate(key, &self.self_id).await.map(|_| ())
    }

    /// Fan out Replicate to every cached peer concurrently. Individual
    /// failures are tolerated and logged by the caller; this just collects
    /// per-peer outcomes.
    pub async fn fanout_replicate(
        &self,
        key: &str,
        envelope_bytes: Bytes,
        ttl: Option<Duration>,
        deadline: Duration,
    ) -> HashMap<NodeId, Result<RpcResponse, TransportError>> {
        let futures = self.clients.iter().map(|entry| {
            let node_id = entry.key().clone();
            let client = Arc::clone(entry.value());
            let key = key.to_string();
            let envelope_bytes = envelope_bytes.clone();
            let self_id = self.self_id.clone();
            async move {
                let result = tokio::time::timeout(
                    deadline,
                    client.replicate(&key, envelope_bytes, ttl, &self_id),
                )
                .await
                .unwrap_or_else(|_| Err(TransportError::Timeout(node_id.to_string())));
                (node_id, result)
            }
        });

        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// Fan out Invalidate to every cached peer concurrently.
    pub async fn fanout_invalidate(
        &self,
        key: &str,
        deadline: Duration,
    ) -> HashMap<NodeId, Result<RpcResponse, TransportError>> {
        let futures = self.clients.iter().map(|entry| {
            let node_id = entry.key().clone();
            let client = Arc::clone(entry.value());
            let key = key.to_string();
            let self_id = self.self_id.clone();
            async move {
                let result = tokio::time::timeout(deadline, client.invalidate(&key, &self_id))
                    .await
                    .unwrap_or_else(|_| Err(TransportError::Timeout(node_id.to_string())));
                (node_id, result)
            }
        });

        futures::future::join_all(futures).await.into_iter().collect()
    }
}

/// Shared state handed to [`PeerServer`] so inbound RPCs can reach C1 and
/// apply C5's conflict resolution rule, without the transport layer holding
/// a reference back up to the engine proper (see the cyclic-ownership note
/// in the design notes).
pub struct PeerServerContext {
    pub store: Arc<dyn LocalStore>,
}
