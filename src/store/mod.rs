mod memory;

pub use memory::InMemoryStore;

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Point-in-time statistics about a local store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub key_count: u64,
    pub memory_bytes: u64,
}

/// Per-node local backing store: opaque bytes in, opaque bytes out.
///
/// This is the one piece of the system explicitly specified as swappable —
/// it knows nothing about envelopes, replication, or conflict resolution.
/// Time-based expiry is handled entirely inside the implementation. Values
/// are `Bytes` rather than `Vec<u8>` so the many concurrent clones a
/// fan-out round takes of the same payload are refcount bumps, not copies.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Fetch the raw bytes stored for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Store `value` for `key`. `ttl` of `None` or `<= 0` seconds means no
    /// expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete `key`. Deleting an absent key is success (idempotent).
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Current size statistics, used by the engine's `stats()`.
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}
