//! kadroute core - shared types, wire messages, and storage contracts
//!
//! This crate provides the building blocks shared by the routing table,
//! the lookup protocol, and the tooling around them.

pub mod error;
pub mod proto;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use storage::{KeyValueStore, LoggingStore, MemoryStore, SqliteStore};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Default node identifier length in bytes
pub const DEFAULT_ID_LENGTH: usize = 20;
