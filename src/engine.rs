//! C5: the cache engine. Orchestrates the local store (C1), the hash ring
//! (C2), the coordination client (C3), and peer transport (C4) into
//! `set`/`get`/`delete`/`stats`/`healthy`.

use crate::config::EngineConfig;
use crate::coordination::{
    CoordinationClient, MembershipEvent, MembershipSupervisor,
};
use crate::envelope::Envelope;
use crate::error::{CacheError, Result};
use crate::hash_ring::{HashRing, NodeId};
use crate::metrics::MetricsSink;
use crate::store::LocalStore;
use crate::transport::{PeerServerContext, PeerTransport, RpcResponse};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// `stats()`'s external shape, per §6.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub key_count: u64,
    pub memory_bytes: u64,
    pub memory_peak: u64,
    pub connected_clients: u64,
}

pub struct CacheEngine {
    config: EngineConfig,
    self_id: NodeId,
    store: Arc<dyn LocalStore>,
    ring: RwLock<HashRing>,
    transport: Arc<PeerTransport>,
    metrics: Arc<dyn MetricsSink>,
    memory_peak: AtomicU64,
    supervisor: MembershipSupervisor,
}

impl CacheEngine {
    /// Build a running engine: registers with `coordination`, spawns the
    /// C3 watch/poll supervisor, and spawns the task that applies
    /// membership deltas onto C2/C4. Returns the engine plus the context a
    /// caller should hand to a [`crate::transport::PeerServer`] so inbound
    /// peer RPCs reach the same local store.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn LocalStore>,
        coordination: Arc<dyn CoordinationClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Arc<Self>, Arc<PeerServerContext>) {
        let self_id = NodeId(config.node_id.clone());

        let mut ring = HashRing::new(config.ring_virtual_slots);
        ring.add_node(self_id.clone());

        let transport = Arc::new(PeerTransport::new(&config));

        let (supervisor, mut events) = MembershipSupervisor::spawn(
            coordination,
            config.node_descriptor(),
            config.coordination_poll_interval,
        );

        let engine = Arc::new(CacheEngine {
            config,
            self_id: self_id.clone(),
            store: store.clone(),
            ring: RwLock::new(ring),
            transport,
            metrics,
            memory_peak: AtomicU64::new(0),
            supervisor,
        });

        let membership_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                membership_engine.apply_membership_event(event).await;
            }
        });

        let context = Arc::new(PeerServerContext { store });
        (engine, context)
    }

    async fn apply_membership_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Add(descriptor) => {
                let id = NodeId(descriptor.node_id.clone());
                self.ring.write().await.add_node(id.clone());
                self.transport
                    .add_peer(id, descriptor.host, descriptor.peer_port);
                self.metrics.set_gauge(
                    "cache.ring.members",
                    self.ring.read().await.len() as u64,
                );
                info!(node_id = %descriptor.node_id, "membership add");
            }
            MembershipEvent::Remove(node_id) => {
                let id = NodeId(node_id.clone());
                self.ring.write().await.remove_node(&id);
                self.transport.remove_peer(&id);
                self.metrics.set_gauge(
                    "cache.ring.members",
                    self.ring.read().await.len() as u64,
                );
                info!(%node_id, "membership remove");
            }
        }
    }

    /// §4.5.1 SET.
    pub async fn set(&self, key: &str, value: impl Into<Bytes>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let ttl = ttl.filter(|d| !d.is_zero());

        let envelope = Envelope::new(value);
        let envelope_bytes = envelope.encode();

        let targets = self
            .ring
            .read()
            .await
            .replicas_for(key, self.config.replica_factor);
        if targets.is_empty() {
            return Err(CacheError::Degraded("ring has no members"));
        }

        let writes = targets.iter().map(|target| {
            let target = target.clone();
            let key = key.to_string();
            let envelope_bytes = envelope_bytes.clone();
            async move {
                let is_local = target == self.self_id;
                let ok = if is_local {
                    match self.store.set(&key, envelope_bytes, ttl).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(%key, error = %e, "local write failed in set");
                            false
                        }
                    }
                } else {
                    match self.transport.direct_set(&target, &key, envelope_bytes, ttl).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(peer = %target, %key, error = %e, "direct set to replica failed");
                            false
                        }
                    }
                };
                (is_local, ok)
            }
        });

        let mut local_ok = false;
        let mut peer_ok = false;
        for (is_local, ok) in futures::future::join_all(writes).await {
            if ok {
                if is_local {
                    local_ok = true;
                } else {
                    peer_ok = true;
                }
            }
        }

        let replicate_results = self
            .transport
            .fanout_replicate(key, envelope_bytes.clone(), ttl, self.config.fanout_deadline)
            .await;
        for (peer, result) in &replicate_results {
            match result {
                Ok(resp) if resp.success => {
                    peer_ok = true;
                    self.metrics.record_counter("cache.replicate.sent", 1);
                }
                Ok(resp) => {
                    debug!(%peer, message = %resp.message, "replicate acknowledged failure");
                }
                Err(e) => {
                    self.metrics.record_counter("cache.peer.failures", 1);
                    debug!(%peer, error = %e, "replicate fanout failed");
                }
            }
        }

        self.schedule_secondary_replicate(key.to_string(), envelope_bytes, ttl);

        self.metrics.record_counter("cache.set.total", 1);

        if local_ok || peer_ok {
            Ok(())
        } else {
            Err(CacheError::AllReplicasFailed)
        }
    }

    fn schedule_secondary_replicate(&self, key: String, envelope_bytes: Bytes, ttl: Option<Duration>) {
        let transport = Arc::clone(&self.transport);
        let delay = self.config.secondary_replicate_delay;
        let fanout_deadline = self.config.fanout_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let results = transport
                .fanout_replicate(&key, envelope_bytes, ttl, fanout_deadline)
                .await;
            let failures = results.values().filter(|r| r.is_err()).count();
            if failures > 0 {
                debug!(%key, failures, "secondary replicate had failures");
            }
        });
    }

    /// §4.5.2 GET.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;

        let targets = self
            .ring
            .read()
            .await
            .replicas_for(key, self.config.replica_factor);
        if targets.is_empty() {
            return Err(CacheError::Degraded("ring has no members"));
        }

        let futures = targets.iter().map(|target| {
            let key = key.to_string();
            async move {
                if *target == self.self_id {
                    self.store.get(&key).await.map_err(CacheError::from)
                } else {
                    self.transport
                        .direct_get(target, &key)
                        .await
                        .map_err(CacheError::from)
                }
            }
        });

        let results = futures::future::join_all(futures).await;

        let mut best: Option<Envelope> = None;
        let mut any_ok = false;

        for result in results {
            match result {
                Ok(Some(bytes)) => {
                    any_ok = true;
                    let env = Envelope::decode(&bytes);
                    if best.as_ref().map_or(true, |b| env.timestamp > b.timestamp) {
                        best = Some(env);
                    }
                }
                Ok(None) => any_ok = true,
                Err(e) => debug!(%key, error = %e, "get target failed"),
            }
        }

        self.metrics.record_counter("cache.get.total", 1);
        if best.is_some() {
            self.metrics.record_counter("cache.get.hit", 1);
        } else {
            self.metrics.record_counter("cache.get.miss", 1);
        }

        if !any_ok {
            return Err(CacheError::AllReplicasFailed);
        }

        Ok(best.map(|env| env.data))
    }

    /// §4.5.3 DELETE.
    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;

        let mut delete_set = self.ring.read().await.members();
        if delete_set.is_empty() {
            delete_set = self
                .ring
                .read()
                .await
                .replicas_for(key, self.config.replica_factor);
        }

        let deletes = delete_set.iter().map(|node| {
            let node = node.clone();
            let key = key.to_string();
            async move {
                let is_local = node == self.self_id;
                let ok = if is_local {
                    match self.store.delete(&key).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(%key, error = %e, "local delete failed");
                            false
                        }
                    }
                } else {
                    match self.transport.direct_delete(&node, &key).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(peer = %node, %key, error = %e, "direct delete failed");
                            false
                        }
                    }
                };
                (is_local, ok)
            }
        });

        let mut local_ok = false;
        let mut peer_ok = false;
        for (is_local, ok) in futures::future::join_all(deletes).await {
            if ok {
                if is_local {
                    local_ok = true;
                } else {
                    peer_ok = true;
                }
            }
        }

        let results = self
            .transport
            .fanout_invalidate(key, self.config.fanout_deadline)
            .await;
        for (peer, result) in &results {
            match result {
                Ok(resp) if resp.success => peer_ok = true,
                Ok(resp) => debug!(%peer, message = %resp.message, "invalidate acknowledged failure"),
                Err(e) => {
                    self.metrics.record_counter("cache.peer.failures", 1);
                    debug!(%peer, error = %e, "invalidate fanout failed");
                }
            }
        }

        self.schedule_secondary_invalidate(key.to_string());
        self.metrics.record_counter("cache.delete.total", 1);

        if local_ok || peer_ok {
            Ok(())
        } else {
            Err(CacheError::AllReplicasFailed)
        }
    }

    fn schedule_secondary_invalidate(&self, key: String) {
        let transport = Arc::clone(&self.transport);
        let delay = self.config.secondary_invalidate_delay;
        let fanout_deadline = self.config.fanout_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let results = transport.fanout_invalidate(&key, fanout_deadline).await;
            let failures = results.values().filter(|r| r.is_err()).count();
            if failures > 0 {
                debug!(%key, failures, "secondary invalidate had failures");
            }
        });
    }

    /// §4.5.7 stats().
    pub async fn stats(&self) -> Result<Stats> {
        let store_stats = self.store.stats().await?;
        let connected_clients = self.transport.connected_peer_count() as u64;

        let previous_peak = self.memory_peak.load(Ordering::Relaxed);
        let memory_peak = previous_peak.max(store_stats.memory_bytes);
        self.memory_peak.store(memory_peak, Ordering::Relaxed);

        self.metrics.set_gauge("cache.store.key_count", store_stats.key_count);
        self.metrics
            .set_gauge("cache.store.memory_bytes", store_stats.memory_bytes);

        Ok(Stats {
            key_count: store_stats.key_count,
            memory_bytes: store_stats.memory_bytes,
            memory_peak,
            connected_clients,
        })
    }

    /// §4.5.7 healthy(). A node with no coordination at all is still
    /// healthy for local-only traffic (degraded single-node operation).
    pub fn healthy(&self) -> bool {
        use crate::coordination::ConnectionState;
        !matches!(self.supervisor.state(), ConnectionState::Disconnected)
            || self.ring_is_self_only_sync()
    }

    fn ring_is_self_only_sync(&self) -> bool {
        self.ring.try_read().map(|r| r.len() <= 1).unwrap_or(true)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Current ring member count. Exposed for tests that need to wait for
    /// membership convergence across a simulated cluster.
    pub async fn ring_members_len(&self) -> usize {
        self.ring.read().await.len()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::Validation("key must not be empty".to_string()));
    }
    Ok(())
}

/// §4.5.4 conflict resolution, applied by a callee on an inbound
/// `Replicate`. Free function (not a method on [`CacheEngine`]) so the peer
/// RPC server can call it directly against a `LocalStore` without a
/// back-reference into the engine, per the cyclic-ownership design note.
pub async fn apply_replicate(
    store: &dyn LocalStore,
    key: &str,
    incoming_bytes: Bytes,
    ttl: Option<Duration>,
) -> RpcResponse {
    let incoming = Envelope::decode(&incoming_bytes);

    let existing = match store.get(key).await {
        Ok(Some(bytes)) => Some(Envelope::decode(&bytes)),
        Ok(None) => None,
        Err(e) => {
            warn!(%key, error = %e, "local read failed while applying replicate");
            None
        }
    };

    if let Some(existing) = &existing {
        if existing.timestamp >= incoming.timestamp {
            return RpcResponse::ok("skipped: older");
        }
    }

    match store.set(key, incoming_bytes, ttl.filter(|d| !d.is_zero())).await {
        Ok(()) => RpcResponse::ok("applied"),
        Err(e) => RpcResponse::failed(e.to_string()),
    }
}
