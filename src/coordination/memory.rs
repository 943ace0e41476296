use super::{CoordinationClient, MembershipEvent, NodeDescriptor};
use crate::error::CoordinationError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

/// In-process stand-in for a coordination service, shared by cloning the
/// handle (like this codebase's other in-memory `Db`/`CacheNode` types).
/// Used by the crate's integration tests to simulate a multi-node cluster
/// in a single process without a running etcd.
#[derive(Clone)]
pub struct InMemoryCoordinationClient {
    members: Arc<RwLock<HashMap<String, NodeDescriptor>>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl InMemoryCoordinationClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        InMemoryCoordinationClient {
            members: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }
}

impl Default for InMemoryCoordinationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinationClient {
    async fn register(&self, descriptor: NodeDescriptor) -> Result<(), CoordinationError> {
        let node_id = descriptor.node_id.clone();
        self.members.write().await.insert(node_id, descriptor.clone());
        // Best-effort: no subscribers is not an error for a broadcast send.
        let _ = self.events.send(MembershipEvent::Add(descriptor));
        Ok(())
    }

    async fn unregister(&self, node_id: &str) -> Result<(), CoordinationError> {
        self.members.write().await.remove(node_id);
        let _ = self.events.send(MembershipEvent::Remove(node_id.to_string()));
        Ok(())
    }

    async fn members(&self) -> Result<HashMap<String, NodeDescriptor>, CoordinationError> {
        Ok(self.members.read().await.clone())
    }

    async fn watch(
        &self,
    ) -> Result<mpsc::Receiver<Result<MembershipEvent, CoordinationError>>, CoordinationError> {
        let mut rx = self.events.subscribe();
        let (tx, out_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out_rx)
    }
}
