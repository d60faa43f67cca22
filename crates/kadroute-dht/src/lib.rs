//! kadroute DHT - Kademlia routing table and node lookup
//!
//! This crate keeps a partitioned view of known peers (the routing table)
//! and drives the iterative FindNode/Ping/Bootstrap protocol on top of it.

pub mod config;
pub mod context;
pub mod distance;
pub mod lookup;
pub mod node;
pub mod partition;
pub mod replacement;
pub mod routing;
pub mod rpc;
pub mod server;

pub use config::DhtConfig;
pub use context::RequestContext;
pub use lookup::LookupOutcome;
pub use node::Kademlia;
pub use partition::{BucketId, KBucketRange};
pub use routing::{KBucket, NodeStatus, RoutingTable};
pub use rpc::{NodeClient, QueryRequest, QueryResponse};
pub use server::MessageHandler;

use kadroute_core::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Node not found")]
    NodeNotFound,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("All {attempted} contacted nodes were unreachable")]
    Unreachable { attempted: usize },

    #[error("Bootstrap failed: none of {attempted} seed nodes responded")]
    BootstrapFailed { attempted: usize },

    #[error("Pingback to {0} failed")]
    PingbackFailed(NodeId),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Storage error: {0}")]
    Storage(#[from] kadroute_core::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DhtError {
    /// Errors a lookup recovers from by skipping the peer
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DhtError::Timeout
                | DhtError::Network(_)
                | DhtError::Protocol(_)
                | DhtError::Remote { .. }
                | DhtError::PingbackFailed(_)
        )
    }
}

/// Routing table invariant violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("could not find k-bucket for {0}")]
    BucketNotFound(String),

    #[error("compared two equivalent k-bucket ids")]
    IdenticalBucketIds,

    #[error("malformed stored record: {0}")]
    MalformedRecord(String),

    #[error("identifier length mismatch: expected {expected} bytes, got {actual}")]
    IdLength { expected: usize, actual: usize },

    #[error("split depth {depth} out of range for {bits}-bit identifiers")]
    SplitDepth { depth: usize, bits: usize },
}

pub type Result<T> = std::result::Result<T, DhtError>;
