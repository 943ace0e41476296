use std::time::Duration;

/// Process-wide configuration for a single cache node.
///
/// Always constructed explicitly and passed into [`crate::engine::CacheEngine::new`] —
/// there is no hidden global config singleton.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Globally unique identity of this node; also used to derive ring slots
    /// and to tag outgoing RPCs as `originator_node_id`.
    pub node_id: String,
    /// Host other nodes use to reach this node's peer RPC listener.
    pub host: String,
    /// Port this node accepts peer RPCs (Replicate/Invalidate/HealthCheck) on.
    pub peer_port: u16,
    /// Coordination service endpoints (etcd cluster addresses).
    pub coordination_endpoints: Vec<String>,
    /// Target number of replicas per key.
    pub replica_factor: usize,
    /// Virtual slots per physical node on the hash ring.
    pub ring_virtual_slots: usize,
    /// Per-attempt RPC deadline.
    pub peer_rpc_deadline: Duration,
    /// Aggregate fan-out deadline for a Replicate round.
    pub fanout_deadline: Duration,
    /// Delay before the secondary (catch-up) replicate fan-out.
    pub secondary_replicate_delay: Duration,
    /// Delay before the secondary (catch-up) invalidate fan-out.
    pub secondary_invalidate_delay: Duration,
    /// Max retry attempts per peer per RPC.
    pub max_peer_retries: u32,
    /// Base backoff between retry attempts; actual backoff is `base * attempt_index`.
    pub retry_backoff_base: Duration,
    /// Poll interval used by the coordination client's polling fallback.
    pub coordination_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            node_id: "node-1".to_string(),
            host: "127.0.0.1".to_string(),
            peer_port: 7400,
            coordination_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            replica_factor: 3,
            ring_virtual_slots: 100,
            peer_rpc_deadline: Duration::from_secs(2),
            fanout_deadline: Duration::from_secs(8),
            secondary_replicate_delay: Duration::from_secs(1),
            secondary_invalidate_delay: Duration::from_secs(2),
            max_peer_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            coordination_poll_interval: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Build a config from `DIST_CACHE_*` environment variables, falling back
    /// to [`EngineConfig::default`] for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();

        let node_id = std::env::var("DIST_CACHE_NODE_ID").unwrap_or(defaults.node_id);
        let host = std::env::var("DIST_CACHE_HOST").unwrap_or(defaults.host);
        let peer_port = std::env::var("DIST_CACHE_PEER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.peer_port);
        let coordination_endpoints = std::env::var("DIST_CACHE_ETCD_ENDPOINTS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or(defaults.coordination_endpoints);
        let replica_factor = std::env::var("DIST_CACHE_REPLICA_FACTOR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.replica_factor);

        EngineConfig {
            node_id,
            host,
            peer_port,
            coordination_endpoints,
            replica_factor,
            ..defaults
        }
    }

    pub fn node_descriptor(&self) -> crate::coordination::NodeDescriptor {
        crate::coordination::NodeDescriptor {
            node_id: self.node_id.clone(),
            host: self.host.clone(),
            port: self.peer_port,
            peer_port: self.peer_port,
        }
    }
}
