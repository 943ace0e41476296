mod etcd;
mod memory;
mod supervisor;

pub use etcd::EtcdCoordinationClient;
pub use memory::InMemoryCoordinationClient;
pub use supervisor::MembershipSupervisor;

use crate::error::CoordinationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `{ nodeId, host, port, peerPort }` — what the coordination service stores
/// per live node under `/redis-cache/nodes/<nodeId>`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub peer_port: u16,
}

/// A membership delta as delivered to a `subscribe` handler, whether it
/// originated from a real watch event or was synthesized by diffing a fresh
/// poll against the last known snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Add(NodeDescriptor),
    Remove(String),
}

/// The coordination client's connection state machine
/// (`Disconnected -> Connecting -> Connected -> Watching <-> Polling -> Disconnected`),
/// owned and driven by [`MembershipSupervisor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Watching,
    Polling,
}

/// Membership registry: advertises the local node, tracks live peers, and
/// streams add/remove deltas. Implemented by an etcd-backed production
/// client and an in-memory client used for tests and single-process
/// simulation.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Announce the local node. Session-bound: a crash or partition must
    /// cause automatic de-registration at the coordination service.
    async fn register(&self, descriptor: NodeDescriptor) -> Result<(), CoordinationError>;

    /// Explicit clean shutdown.
    async fn unregister(&self, node_id: &str) -> Result<(), CoordinationError>;

    /// Current membership snapshot.
    async fn members(&self) -> Result<HashMap<String, NodeDescriptor>, CoordinationError>;

    /// Attempt to open (or re-open) a watch stream on the membership
    /// directory. Returns a receiver of raw watch-level events; `None`
    /// signals the backend has no watch support and the supervisor should
    /// stay in polling mode.
    async fn watch(
        &self,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<MembershipEvent, CoordinationError>>, CoordinationError>;
}
