//! Distributed in-memory key/value cache: consistent-hash placement,
//! broadcast replication with last-writer-wins conflict resolution, and a
//! coordination-backed membership layer with watch+polling fallback.
//!
//! See [`engine::CacheEngine`] for the orchestrator that ties together the
//! local store ([`store`]), the hash ring ([`hash_ring`]), the coordination
//! client ([`coordination`]), and peer transport ([`transport`]).

pub mod config;
pub mod coordination;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod hash_ring;
pub mod metrics;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{CacheEngine, Stats};
pub use error::{CacheError, Result};
