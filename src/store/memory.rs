use super::{LocalStore, StoreStats};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |exp| Instant::now() >= exp)
    }
}

/// In-memory [`LocalStore`] backed by a sharded concurrent map, with a
/// background sweep task reclaiming expired entries so `stats()` doesn't
/// have to scan lazily-expired garbage.
pub struct InMemoryStore {
    data: Arc<DashMap<String, Entry>>,
    memory_bytes: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            data: Arc::new(DashMap::new()),
            memory_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the background task that evicts expired keys every second.
    /// Mirrors the expiration sweep used by this codebase's single-node KV
    /// store exercises, generalized to run off the struct instead of a
    /// `Db`-specific clone.
    pub fn spawn_expiration_task(&self) {
        let data = Arc::clone(&self.data);
        let memory_bytes = Arc::clone(&self.memory_bytes);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;

                let expired: Vec<String> = data
                    .iter()
                    .filter(|entry| entry.value().is_expired())
                    .map(|entry| entry.key().clone())
                    .collect();

                for key in expired {
                    if let Some((_, entry)) = data.remove(&key) {
                        memory_bytes.fetch_sub(entry_size(&key, &entry.value) as u64, Ordering::Relaxed);
                    }
                }
            }
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_size(key: &str, value: &[u8]) -> usize {
    key.len() + value.len()
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let is_expired = match self.data.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if is_expired {
            // Lazily reclaim on read; the background sweep will also
            // eventually catch it, but no need to wait for it.
            if let Some((_, entry)) = self.data.remove(key) {
                self.memory_bytes
                    .fetch_sub(entry_size(key, &entry.value) as u64, Ordering::Relaxed);
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        let new_size = entry_size(key, &value) as u64;

        if let Some(old) = self.data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
            },
        ) {
            self.memory_bytes
                .fetch_sub(entry_size(key, &old.value) as u64, Ordering::Relaxed);
        }
        self.memory_bytes.fetch_add(new_size, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some((_, entry)) = self.data.remove(key) {
            self.memory_bytes
                .fetch_sub(entry_size(key, &entry.value) as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            key_count: self.data.len() as u64,
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_roundtrip() {
        let store = InMemoryStore::new();
        store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_means_no_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn positive_ttl_expires() {
        let store = InMemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_tracks_key_count_and_size() {
        let store = InMemoryStore::new();
        store.set("k1", Bytes::from_static(b"hello"), None).await.unwrap();
        store.set("k2", Bytes::from_static(b"world!"), None).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.key_count, 2);
        assert_eq!(stats.memory_bytes, (2 + 5 + 2 + 6) as u64);

        store.delete("k1").await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.key_count, 1);
        assert_eq!(stats.memory_bytes, (2 + 6) as u64);
    }
}
