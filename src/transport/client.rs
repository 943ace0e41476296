use super::wire::{
    DirectGetReq, DirectGetResp, Frame, HealthReq, HealthResp, InvalidateReq, ReplicateReq,
    RpcResponse,
};
use crate::error::TransportError;
use crate::hash_ring::NodeId;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One cached connection to a single peer's `PeerServer`. Lazily connects on
/// first send and reconnects on the next send after any I/O error; a mutex
/// around the socket gives single-flight connection establishment and
/// serializes requests to this peer onto one TCP stream, mirroring the
/// "one client instance per peer, cached" requirement.
pub struct PeerClient {
    node_id: NodeId,
    addr: String,
    conn: Mutex<Option<TcpStream>>,
    deadline: Duration,
    max_retries: u32,
    retry_backoff_base: Duration,
}

impl PeerClient {
    pub fn new(
        node_id: NodeId,
        host: String,
        peer_port: u16,
        deadline: Duration,
        max_retries: u32,
        retry_backoff_base: Duration,
    ) -> Self {
        PeerClient {
            node_id,
            addr: format!("{host}:{peer_port}"),
            conn: Mutex::new(None),
            deadline,
            max_retries,
            retry_backoff_base,
        }
    }

    /// Issue `Replicate` and return the callee's `{success, message}`.
    pub async fn replicate(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        originator: &NodeId,
    ) -> Result<RpcResponse, TransportError> {
        let req = Frame::Replicate(ReplicateReq {
            key: key.to_string(),
            value,
            ttl_secs: ttl.map(|d| d.as_secs()),
            originator_node_id: originator.to_string(),
        });

        match self.call_with_retry(req).await? {
            Frame::ReplicateResp(resp) => Ok(resp),
            other => Err(unexpected_frame("ReplicateResp", &other)),
        }
    }

    /// Issue `Invalidate` and return the callee's `{success, message}`.
    pub async fn invalidate(
        &self,
        key: &str,
        originator: &NodeId,
    ) -> Result<RpcResponse, TransportError> {
        let req = Frame::Invalidate(InvalidateReq {
            key: key.to_string(),
            originator_node_id: originator.to_string(),
        });

        match self.call_with_retry(req).await? {
            Frame::InvalidateResp(resp) => Ok(resp),
            other => Err(unexpected_frame("InvalidateResp", &other)),
        }
    }

    /// Issue `HealthCheck`.
    pub async fn health_check(&self, originator: &NodeId) -> Result<HealthResp, TransportError> {
        let req = Frame::HealthCheck(HealthReq {
            node_id: originator.to_string(),
        });

        match self.call_with_retry(req).await? {
            Frame::HealthCheckResp(resp) => Ok(resp),
            other => Err(unexpected_frame("HealthCheckResp", &other)),
        }
    }

    /// Read a peer's local-store bytes for `key` directly, bypassing
    /// conflict resolution. Used by GET to poll replicas and by the
    /// §4.5.1 direct-write SET optimization's symmetric read path.
    pub async fn fetch(&self, key: &str) -> Result<Option<Bytes>, TransportError> {
        let req = Frame::DirectGet(DirectGetReq {
            key: key.to_string(),
        });

        match self.call_with_retry(req).await? {
            Frame::DirectGetResp(DirectGetResp { value }) => Ok(value),
            other => Err(unexpected_frame("DirectGetResp", &other)),
        }
    }

    /// Retry policy: up to `max_retries` attempts, progressive backoff
    /// `retry_backoff_base * attempt_index`. A timed-out or I/O-failed
    /// attempt drops the cached connection so the next attempt reconnects.
    async fn call_with_retry(&self, frame: Frame) -> Result<Frame, TransportError> {
        let mut last_err = TransportError::UnknownPeer(self.node_id.to_string());

        for attempt in 1..=self.max_retries.max(1) {
            match tokio::time::timeout(self.deadline, self.call_once(&frame)).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(e)) => {
                    debug!(peer = %self.node_id, attempt, error = %e, "peer rpc attempt failed");
                    last_err = e;
                }
                Err(_) => {
                    debug!(peer = %self.node_id, attempt, "peer rpc attempt timed out");
                    last_err = TransportError::Timeout(self.node_id.to_string());
                    self.drop_connection().await;
                }
            }

            if attempt < self.max_retries.max(1) {
                tokio::time::sleep(self.retry_backoff_base * attempt).await;
            }
        }

        Err(last_err)
    }

    async fn drop_connection(&self) {
        *self.conn.lock().await = None;
    }

    async fn call_once(&self, frame: &Frame) -> Result<Frame, TransportError> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let stream = guard.as_mut().expect("just ensured Some");
        match send_and_receive(stream, frame).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                // The connection is presumed dead after any framing/IO
                // error; drop it so the next call reconnects from scratch.
                *guard = None;
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;

        let sock_ref = SockRef::from(&stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(peer = %self.node_id, error = %e, "failed to enable tcp keepalive");
        }

        Ok(stream)
    }
}

async fn send_and_receive(stream: &mut TcpStream, frame: &Frame) -> Result<Frame, TransportError> {
    let encoded = bincode::serialize(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
    let len = encoded.len() as u32;

    stream.write_all(&len.to_be_bytes()).await.map_err(TransportError::Io)?;
    stream.write_all(&encoded).await.map_err(TransportError::Io)?;
    stream.flush().await.map_err(TransportError::Io)?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(TransportError::Io)?;
    let resp_len = u32::from_be_bytes(len_buf) as usize;

    let mut resp_buf = vec![0u8; resp_len];
    stream.read_exact(&mut resp_buf).await.map_err(TransportError::Io)?;

    bincode::deserialize(&resp_buf).map_err(|e| TransportError::Codec(e.to_string()))
}

fn unexpected_frame(expected: &str, got: &Frame) -> TransportError {
    TransportError::Codec(format!("expected {expected}, got {got:?}"))
}
