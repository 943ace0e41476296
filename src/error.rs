use thiserror::Error;

/// Errors surfaced by the local backing store (C1).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is corrupted: {0}")]
    Corrupt(String),
}

/// Errors surfaced by a single peer RPC attempt (C4).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request to peer {0} timed out")]
    Timeout(String),

    #[error("peer {0} rejected request: {1}")]
    Rejected(String, String),

    #[error("no client cached for peer {0}")]
    UnknownPeer(String),

    #[error("frame encode/decode error: {0}")]
    Codec(String),
}

/// Errors surfaced by the coordination client (C3).
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordination service unreachable: {0}")]
    Unreachable(String),

    #[error("session expired")]
    SessionExpired,

    #[error("watch stream failed: {0}")]
    WatchFailed(String),

    #[error("authentication error: {0}")]
    AuthFailed(String),
}

/// Top-level client-visible error taxonomy for the cache engine (C5).
///
/// Only `Validation`, `AllReplicasFailed` and `Degraded` are meant to reach a
/// caller; everything else is absorbed and logged inside the engine per the
/// propagation policy.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("all replicas failed for this operation")]
    AllReplicasFailed,

    #[error("engine degraded: {0}")]
    Degraded(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

pub type Result<T> = std::result::Result<T, CacheError>;
