//! End-to-end cluster scenarios (§8 S1-S5): several real `CacheEngine`s,
//! each with its own `PeerServer` bound to a loopback TCP port, sharing one
//! in-memory coordination service the way a real etcd cluster would be
//! shared.

use bytes::Bytes;
use dist_cache::config::EngineConfig;
use dist_cache::coordination::InMemoryCoordinationClient;
use dist_cache::engine::CacheEngine;
use dist_cache::metrics::NoopMetricsSink;
use dist_cache::store::{InMemoryStore, LocalStore};
use dist_cache::transport::PeerServer;
use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(node_id: &str, peer_port: u16) -> EngineConfig {
    EngineConfig {
        node_id: node_id.to_string(),
        host: "127.0.0.1".to_string(),
        peer_port,
        coordination_endpoints: vec![],
        replica_factor: 3,
        ring_virtual_slots: 100,
        peer_rpc_deadline: Duration::from_millis(500),
        fanout_deadline: Duration::from_secs(2),
        secondary_replicate_delay: Duration::from_millis(100),
        secondary_invalidate_delay: Duration::from_millis(100),
        max_peer_retries: 2,
        retry_backoff_base: Duration::from_millis(20),
        coordination_poll_interval: Duration::from_millis(30),
    }
}

/// A running cluster member: its engine plus the peer RPC server task
/// accepting `Replicate`/`Invalidate`/`HealthCheck`/`DirectGet` connections
/// for it. Derefs to `CacheEngine` so callers can use it directly as one.
struct Node {
    engine: Arc<CacheEngine>,
    peer_task: tokio::task::JoinHandle<Result<(), std::io::Error>>,
    peer_port: u16,
}

impl std::ops::Deref for Node {
    type Target = CacheEngine;
    fn deref(&self) -> &CacheEngine {
        &self.engine
    }
}

impl Node {
    /// Abort the peer RPC server task, simulating a crashed or partitioned
    /// node: other nodes' cached `PeerClient`s will see connection refused
    /// or a timeout on their next RPC to this node, while this process's
    /// own engine (and coordination registration) keeps running.
    fn kill(self) {
        self.peer_task.abort();
    }
}

async fn spawn_node(node_id: &str, coordination: Arc<InMemoryCoordinationClient>) -> Node {
    spawn_node_on_port(node_id, coordination, free_port()).await
}

/// Like [`spawn_node`], but binds a caller-chosen peer port. Used to bring a
/// "restarted" node back up on the same address a killed node vacated.
async fn spawn_node_on_port(
    node_id: &str,
    coordination: Arc<InMemoryCoordinationClient>,
    peer_port: u16,
) -> Node {
    let config = test_config(node_id, peer_port);

    let (engine, ctx) = CacheEngine::start(
        config.clone(),
        Arc::new(InMemoryStore::new()),
        coordination,
        Arc::new(NoopMetricsSink),
    )
    .await;

    let addr = format!("127.0.0.1:{peer_port}");
    let server = PeerServer::bind(&addr, ctx).await.unwrap();
    let peer_task = tokio::spawn(server.run());

    Node {
        engine,
        peer_task,
        peer_port,
    }
}

/// Wait until every engine's ring has at least `expected` members.
async fn wait_for_convergence(engines: &[Arc<CacheEngine>], expected: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let mut converged = true;
        for engine in engines {
            if engine.ring_members_len().await < expected {
                converged = false;
                break;
            }
        }
        if converged {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("cluster membership did not converge within deadline");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Bring up an N-node cluster sharing one coordination service and give
/// membership time to converge across all of them.
async fn spawn_cluster(node_ids: &[&str]) -> Vec<Node> {
    let coordination = Arc::new(InMemoryCoordinationClient::new());

    let mut nodes = Vec::new();
    for id in node_ids {
        nodes.push(spawn_node(id, coordination.clone()).await);
    }

    let engines: Vec<Arc<CacheEngine>> = nodes.iter().map(|n| n.engine.clone()).collect();
    wait_for_convergence(&engines, node_ids.len()).await;

    nodes
}

async fn wait_for_value(engine: &CacheEngine, key: &str) -> Option<Bytes> {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(Some(v)) = engine.get(key).await {
            return Some(v);
        }
        if std::time::Instant::now() > deadline {
            return engine.get(key).await.unwrap_or(None);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_expected(engine: &CacheEngine, key: &str, expected: &[u8]) -> Option<Bytes> {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(Some(v)) = engine.get(key).await {
            if v == expected {
                return Some(v);
            }
        }
        if std::time::Instant::now() > deadline {
            return engine.get(key).await.unwrap_or(None);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_until_absent(engine: &CacheEngine, key: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(None) = engine.get(key).await {
            return;
        }
        if std::time::Instant::now() > deadline {
            assert_eq!(engine.get(key).await.unwrap(), None);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn s1_cross_node_read_your_write() {
    let engines = spawn_cluster(&["n1", "n2", "n3"]).await;

    engines[0].set("k", b"v1".to_vec(), None).await.unwrap();

    for engine in &engines {
        let value = wait_for_value(engine, "k").await;
        assert_eq!(value, Some(b"v1".to_vec()));
    }
}

#[tokio::test]
async fn s2_conflict_resolution_highest_timestamp_wins() {
    let engines = spawn_cluster(&["n1", "n2", "n3"]).await;

    engines[0].set("k", b"old".to_vec(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    engines[1].set("k", b"new".to_vec(), None).await.unwrap();

    for engine in &engines {
        let value = wait_for_expected(engine, "k", b"new").await;
        assert_eq!(value, Some(b"new".to_vec()));
    }
}

#[tokio::test]
async fn s3_ttl_expiry() {
    let engines = spawn_cluster(&["n1", "n2", "n3"]).await;

    engines[0]
        .set("k", b"v".to_vec(), Some(Duration::from_millis(300)))
        .await
        .unwrap();

    let value = wait_for_value(&engines[1], "k").await;
    assert_eq!(value, Some(b"v".to_vec()));

    tokio::time::sleep(Duration::from_millis(600)).await;

    for engine in &engines {
        assert_eq!(engine.get("k").await.unwrap(), None);
    }
}

#[tokio::test]
async fn s4_fault_tolerance_survives_peer_removal() {
    let coordination = Arc::new(InMemoryCoordinationClient::new());
    let n1 = spawn_node("n1", coordination.clone()).await;
    let n2 = spawn_node("n2", coordination.clone()).await;
    let n3 = spawn_node("n3", coordination.clone()).await;
    wait_for_convergence(&[n1.engine.clone(), n2.engine.clone(), n3.engine.clone()], 3).await;

    n1.set("k", b"v".to_vec(), None).await.unwrap();
    wait_for_value(&n2, "k").await;
    wait_for_value(&n3, "k").await;

    // Kill n2: n1 and n3 never talked to n2's local store directly, both
    // already hold their own replica from the broadcast Replicate fan-out,
    // so a dead n2 does not affect their reads.
    let n2_port = n2.peer_port;
    n2.kill();

    assert_eq!(n1.get("k").await.unwrap(), Some(b"v".to_vec()));
    assert_eq!(n3.get("k").await.unwrap(), Some(b"v".to_vec()));

    // Restart n2 on the same address and wait for membership to reconverge.
    let n2 = spawn_node_on_port("n2", coordination.clone(), n2_port).await;
    wait_for_convergence(&[n1.engine.clone(), n2.engine.clone(), n3.engine.clone()], 3).await;

    // A fresh SET now propagates to the restarted node.
    n1.set("k2", b"v2".to_vec(), None).await.unwrap();
    assert_eq!(wait_for_value(&n2, "k2").await, Some(b"v2".to_vec()));
}

#[tokio::test]
async fn s5_delete_propagates_to_all_nodes() {
    let engines = spawn_cluster(&["n1", "n2", "n3"]).await;

    engines[0].set("k", b"v".to_vec(), None).await.unwrap();
    wait_for_value(&engines[1], "k").await;
    wait_for_value(&engines[2], "k").await;

    engines[1].delete("k").await.unwrap();

    for engine in &engines {
        wait_until_absent(engine, "k").await;
    }
}

#[tokio::test]
async fn single_node_cluster_serves_without_peers() {
    let engines = spawn_cluster(&["solo"]).await;

    engines[0].set("k", b"v".to_vec(), None).await.unwrap();
    assert_eq!(engines[0].get("k").await.unwrap(), Some(b"v".to_vec()));

    engines[0].delete("k").await.unwrap();
    assert_eq!(engines[0].get("k").await.unwrap(), None);
}

#[tokio::test]
async fn stale_set_after_delete_can_resurrect_key() {
    // §5 accepted limitation: deletions are unconditional and unstamped,
    // so a late-arriving Replicate for a pre-delete timestamp recreates
    // the key. Exercised directly against `apply_replicate` since driving
    // real out-of-order network delivery deterministically needs control
    // the public engine API doesn't expose.
    use dist_cache::engine::apply_replicate;
    use dist_cache::envelope::Envelope;

    let store = InMemoryStore::new();
    store
        .set("k", Envelope::with_timestamp(1000, b"v".to_vec()).encode(), None)
        .await
        .unwrap();
    store.delete("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), None);

    let resp = apply_replicate(
        &store,
        "k",
        Envelope::with_timestamp(1000, b"v".to_vec()).encode(),
        None,
    )
    .await;
    assert!(resp.success);
    assert!(store.get("k").await.unwrap().is_some());
}

#[tokio::test]
async fn s6_load_concurrent_sets_are_all_retrievable_with_bounded_latency() {
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    const TOTAL_OPS: usize = 1000;
    const CONCURRENCY: usize = 10;

    let engines = spawn_cluster(&["n1", "n2", "n3"]).await;
    let keys: Vec<String> = {
        let mut rng = rand::thread_rng();
        (0..TOTAL_OPS)
            .map(|i| format!("load-{i}-{:08x}", rng.gen::<u32>()))
            .collect()
    };

    let semaphore = Arc::new(Semaphore::new(CONCURRENCY));
    let latencies_micros = Arc::new(std::sync::Mutex::new(Vec::with_capacity(TOTAL_OPS)));
    let failures = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(TOTAL_OPS);
    for key in keys.clone() {
        let engine = Arc::clone(&engines[0].engine);
        let semaphore = Arc::clone(&semaphore);
        let latencies_micros = Arc::clone(&latencies_micros);
        let failures = Arc::clone(&failures);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();
            let started = Instant::now();
            let result = engine.set(&key, key.clone().into_bytes(), None).await;
            latencies_micros
                .lock()
                .unwrap()
                .push(started.elapsed().as_micros() as u64);
            if result.is_err() {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(failures.load(Ordering::Relaxed), 0, "every SET must succeed");

    // Every key must be retrievable, from the node that accepted the write
    // as well as from a peer it replicated to.
    for key in &keys {
        let expected = key.clone().into_bytes();
        assert_eq!(
            wait_for_value(&engines[0], key).await,
            Some(Bytes::from(expected.clone()))
        );
        assert_eq!(
            wait_for_value(&engines[1], key).await,
            Some(Bytes::from(expected))
        );
    }

    let mut latencies = latencies_micros.lock().unwrap().clone();
    latencies.sort_unstable();
    let p95_index = ((latencies.len() as f64) * 0.95) as usize;
    let p95_micros = latencies[p95_index.min(latencies.len() - 1)];
    assert!(
        p95_micros < 100_000,
        "p95 SET latency {p95_micros}us exceeded the 100ms local budget"
    );
}
