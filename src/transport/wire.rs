use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// `ReplicateReq = { key, value, ttl, originator_node_id }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateReq {
    pub key: String,
    /// Envelope bytes, opaque to the wire layer.
    pub value: Bytes,
    pub ttl_secs: Option<u64>,
    pub originator_node_id: String,
}

/// `InvalidateReq = { key, originator_node_id }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidateReq {
    pub key: String,
    pub originator_node_id: String,
}

/// `HealthReq = { node_id }`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReq {
    pub node_id: String,
}

/// `{success, message}`, the uniform response shape for Replicate and
/// Invalidate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcResponse {
    pub success: bool,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        RpcResponse {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        RpcResponse {
            success: false,
            message: message.into(),
        }
    }
}

/// `{status, message}` — HealthCheck's response shape.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResp {
    pub status: String,
    pub message: String,
}

/// `DirectGet` is this implementation's RPC for the §4.5.1 direct-read
/// optimization (reading a replica's local store without going through the
/// replicate/conflict-resolution path). It is not part of the
/// spec-mandated three RPCs, but the spec explicitly allows "an equivalent
/// implementation" for the direct-write path, and GET needs a symmetric
/// direct-read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectGetReq {
    pub key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectGetResp {
    pub value: Option<Bytes>,
}

/// One length-prefixed frame on the peer wire. A single tagged enum keeps
/// the framing code (see [`super::client`]/[`super::server`]) oblivious to
/// which RPC it's carrying.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Replicate(ReplicateReq),
    ReplicateResp(RpcResponse),
    Invalidate(InvalidateReq),
    InvalidateResp(RpcResponse),
    HealthCheck(HealthReq),
    HealthCheckResp(HealthResp),
    DirectGet(DirectGetReq),
    DirectGetResp(DirectGetResp),
}
