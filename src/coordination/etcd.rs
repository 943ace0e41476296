use super::{CoordinationClient, MembershipEvent, NodeDescriptor};
use crate::error::CoordinationError;
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const NODES_PREFIX: &str = "/redis-cache/nodes/";
/// Lease TTL in seconds; long enough to absorb a missed keepalive tick
/// without flapping membership, short enough that a crashed node's key
/// disappears promptly.
const LEASE_TTL_SECS: i64 = 10;

fn node_key(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}")
}

fn node_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(NODES_PREFIX)
}

/// Production [`CoordinationClient`] backed by etcd: registration is a
/// leased key so a crash or partition causes automatic de-registration when
/// the lease expires, and the watch is a native etcd prefix watch on
/// `/redis-cache/nodes/`.
pub struct EtcdCoordinationClient {
    client: Arc<Mutex<Client>>,
}

impl EtcdCoordinationClient {
    pub async fn connect(endpoints: &[String]) -> Result<Self, CoordinationError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;

        Ok(EtcdCoordinationClient {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinationClient {
    async fn register(&self, descriptor: NodeDescriptor) -> Result<(), CoordinationError> {
        let mut client = self.client.lock().await;

        let lease = client
            .lease_grant(LEASE_TTL_SECS, None)
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;
        let lease_id = lease.id();

        let value = serde_json::to_vec(&descriptor)
            .expect("node descriptor serialization is infallible");

        client
            .put(
                node_key(&descriptor.node_id),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;

        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;

        // Keep the lease alive for as long as the process runs; session
        // expiry (missed keepalives, e.g. on crash) is what de-registers us.
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                (LEASE_TTL_SECS / 3).max(1) as u64,
            ));
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        });

        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> Result<(), CoordinationError> {
        let mut client = self.client.lock().await;
        client
            .delete(node_key(node_id), None)
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn members(&self) -> Result<HashMap<String, NodeDescriptor>, CoordinationError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(NODES_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| CoordinationError::Unreachable(e.to_string()))?;

        let mut members = HashMap::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|e| CoordinationError::Unreachable(e.to_string()))?;
            let Some(node_id) = node_id_from_key(key) else {
                continue;
            };
            if let Ok(descriptor) = serde_json::from_slice::<NodeDescriptor>(kv.value()) {
                members.insert(node_id.to_string(), descriptor);
            }
        }
        Ok(members)
    }

    async fn watch(
        &self,
    ) -> Result<mpsc::Receiver<Result<MembershipEvent, CoordinationError>>, CoordinationError> {
        let mut client = self.client.lock().await;
        let (_watcher, mut stream) = client
            .watch(NODES_PREFIX, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| CoordinationError::WatchFailed(e.to_string()))?;
        drop(client);

        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            // Keep the watcher id alive for the lifetime of the stream by
            // holding it in this task's scope.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let _ = tx
                                .send(Err(CoordinationError::WatchFailed(
                                    "watch canceled by server".to_string(),
                                )))
                                .await;
                            break;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            let Some(node_id) = node_id_from_key(key) else {
                                continue;
                            };

                            let membership_event = match event.event_type() {
                                EventType::Put => {
                                    match serde_json::from_slice::<NodeDescriptor>(kv.value()) {
                                        Ok(descriptor) => MembershipEvent::Add(descriptor),
                                        Err(_) => continue,
                                    }
                                }
                                EventType::Delete => MembershipEvent::Remove(node_id.to_string()),
                            };

                            if tx.send(Ok(membership_event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(CoordinationError::WatchFailed(e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
