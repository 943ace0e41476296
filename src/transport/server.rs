use super::wire::{DirectGetResp, Frame, HealthResp, RpcResponse};
use super::PeerServerContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Accepts peer RPC connections on `peerPort` and dispatches decoded frames
/// to the local store, applying conflict resolution on `Replicate` per
/// §4.5.4. One task per connection, mirroring this codebase's other
/// TCP servers.
pub struct PeerServer {
    listener: TcpListener,
    context: Arc<PeerServerContext>,
}

impl PeerServer {
    pub async fn bind(addr: &str, context: Arc<PeerServerContext>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(PeerServer { listener, context })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        info!("peer rpc server listening");
        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, context).await {
                    debug!(%peer_addr, error = %e, "peer connection closed");
                }
            });
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    context: Arc<PeerServerContext>,
) -> Result<(), std::io::Error> {
    loop {
        let mut len_buf = [0u8; 4];
        if let Err(e) = socket.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e);
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        socket.read_exact(&mut buf).await?;

        let frame: Frame = match bincode::deserialize(&buf) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to decode peer frame");
                return Ok(());
            }
        };

        let response = dispatch(&context, frame).await;

        let encoded = bincode::serialize(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        socket.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
        socket.write_all(&encoded).await?;
        socket.flush().await?;
    }
}

async fn dispatch(context: &PeerServerContext, frame: Frame) -> Frame {
    match frame {
        Frame::Replicate(req) => {
            let ttl = req.ttl_secs.map(Duration::from_secs);
            let resp = crate::engine::apply_replicate(
                context.store.as_ref(),
                &req.key,
                req.value,
                ttl,
            )
            .await;
            Frame::ReplicateResp(resp)
        }
        Frame::Invalidate(req) => {
            let resp = match context.store.delete(&req.key).await {
                Ok(()) => RpcResponse::ok("deleted"),
                Err(e) => {
                    error!(key = %req.key, error = %e, "local delete failed on invalidate");
                    RpcResponse::failed(e.to_string())
                }
            };
            Frame::InvalidateResp(resp)
        }
        Frame::HealthCheck(req) => Frame::HealthCheckResp(HealthResp {
            status: "ok".to_string(),
            message: format!("alive, originator={}", req.node_id),
        }),
        Frame::DirectGet(req) => {
            let value = context.store.get(&req.key).await.unwrap_or_else(|e| {
                error!(key = %req.key, error = %e, "local get failed on direct read");
                None
            });
            Frame::DirectGetResp(DirectGetResp { value })
        }
        other => {
            warn!(frame = ?other, "peer server received a response frame as a request");
            Frame::InvalidateResp(RpcResponse::failed("unexpected frame kind"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::transport::wire::{DirectGetReq, HealthReq, InvalidateReq, ReplicateReq};

    async fn serve() -> (std::net::SocketAddr, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let context = Arc::new(PeerServerContext {
            store: store.clone(),
        });
        let server = PeerServer::bind("127.0.0.1:0", context).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, store)
    }

    async fn roundtrip(addr: std::net::SocketAddr, frame: &Frame) -> Frame {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let encoded = bincode::serialize(frame).unwrap();
        stream
            .write_all(&(encoded.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&encoded).await.unwrap();
        stream.flush().await.unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        bincode::deserialize(&buf).unwrap()
    }

    #[tokio::test]
    async fn replicate_then_direct_get_round_trips() {
        let (addr, _store) = serve().await;

        let env = crate::envelope::Envelope::with_timestamp(1000, b"hello".to_vec());
        let resp = roundtrip(
            addr,
            &Frame::Replicate(ReplicateReq {
                key: "k".to_string(),
                value: env.encode(),
                ttl_secs: None,
                originator_node_id: "n2".to_string(),
            }),
        )
        .await;
        assert!(matches!(resp, Frame::ReplicateResp(r) if r.success));

        let resp = roundtrip(
            addr,
            &Frame::DirectGet(DirectGetReq {
                key: "k".to_string(),
            }),
        )
        .await;
        match resp {
            Frame::DirectGetResp(DirectGetResp { value: Some(bytes) }) => {
                assert_eq!(crate::envelope::Envelope::decode(&bytes).data, &b"hello"[..]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn older_replicate_is_skipped() {
        let (addr, _store) = serve().await;

        let newer = crate::envelope::Envelope::with_timestamp(2000, b"new".to_vec());
        roundtrip(
            addr,
            &Frame::Replicate(ReplicateReq {
                key: "k".to_string(),
                value: newer.encode(),
                ttl_secs: None,
                originator_node_id: "n2".to_string(),
            }),
        )
        .await;

        let older = crate::envelope::Envelope::with_timestamp(1000, b"old".to_vec());
        let resp = roundtrip(
            addr,
            &Frame::Replicate(ReplicateReq {
                key: "k".to_string(),
                value: older.encode(),
                ttl_secs: None,
                originator_node_id: "n3".to_string(),
            }),
        )
        .await;
        assert!(matches!(resp, Frame::ReplicateResp(r) if r.success && r.message.contains("skipped")));

        let resp = roundtrip(
            addr,
            &Frame::DirectGet(DirectGetReq {
                key: "k".to_string(),
            }),
        )
        .await;
        match resp {
            Frame::DirectGetResp(DirectGetResp { value: Some(bytes) }) => {
                assert_eq!(crate::envelope::Envelope::decode(&bytes).data, &b"new"[..]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidate_deletes_key() {
        let (addr, store) = serve().await;
        store
            .set("k", bytes::Bytes::from_static(b"v"), None)
            .await
            .unwrap();

        let resp = roundtrip(
            addr,
            &Frame::Invalidate(InvalidateReq {
                key: "k".to_string(),
                originator_node_id: "n2".to_string(),
            }),
        )
        .await;
        assert!(matches!(resp, Frame::InvalidateResp(r) if r.success));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let (addr, _store) = serve().await;
        let resp = roundtrip(
            addr,
            &Frame::HealthCheck(HealthReq {
                node_id: "n1".to_string(),
            }),
        )
        .await;
        assert!(matches!(resp, Frame::HealthCheckResp(r) if r.status == "ok"));
    }
}
