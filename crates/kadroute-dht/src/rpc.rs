//! Query and Ping RPCs
//!
//! Domain request/response types, their envelope encoding, and the
//! [`NodeClient`] seam the DHT node uses to reach peers. Wire messages from
//! `kadroute_core::proto` never leave this module and `server`.

use crate::{DhtError, Result};
use async_trait::async_trait;
use kadroute_core::proto::{self, Envelope, Payload};
use kadroute_core::{Node, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

/// Request ID counter, initialized with a random offset to avoid collisions across sessions
static REQUEST_COUNTER: LazyLock<AtomicU64> = LazyLock::new(|| {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        return AtomicU64::new(ts);
    }
    AtomicU64::new(u64::from_le_bytes(buf))
});

/// Get the next request ID
pub fn next_request_id() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Ask a peer for the nodes it knows nearest to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sender: Node,
    pub target: NodeId,
    /// Maximum nodes in the answer; 0 lets the server pick its bucket size
    pub limit: usize,
    /// Ask the server to ping us back before trusting `sender`
    pub pingback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub sender: Node,
    pub nodes: Vec<Node>,
}

fn protocol(context: &str, e: impl std::fmt::Display) -> DhtError {
    DhtError::Protocol(format!("{}: {}", context, e))
}

fn node_from_wire(node: Option<proto::Node>, field: &str) -> Result<Node> {
    let node = node.ok_or_else(|| DhtError::Protocol(format!("missing {}", field)))?;
    Node::try_from(node).map_err(|e| protocol(field, e))
}

impl From<&QueryRequest> for proto::QueryRequest {
    fn from(request: &QueryRequest) -> Self {
        Self {
            sender: Some(proto::Node::from(&request.sender)),
            target: request.target.as_bytes().to_vec(),
            limit: u32::try_from(request.limit).unwrap_or(u32::MAX),
            pingback: request.pingback,
        }
    }
}

impl TryFrom<proto::QueryRequest> for QueryRequest {
    type Error = DhtError;

    fn try_from(request: proto::QueryRequest) -> Result<Self> {
        if request.target.is_empty() {
            return Err(DhtError::Protocol("query without target".to_string()));
        }
        Ok(Self {
            sender: node_from_wire(request.sender, "sender")?,
            target: NodeId::new(request.target),
            limit: request.limit as usize,
            pingback: request.pingback,
        })
    }
}

impl From<&QueryResponse> for proto::QueryResponse {
    fn from(response: &QueryResponse) -> Self {
        Self {
            sender: Some(proto::Node::from(&response.sender)),
            response: response.nodes.iter().map(proto::Node::from).collect(),
        }
    }
}

impl TryFrom<proto::QueryResponse> for QueryResponse {
    type Error = DhtError;

    fn try_from(response: proto::QueryResponse) -> Result<Self> {
        let sender = node_from_wire(response.sender, "sender")?;
        let nodes = response
            .response
            .into_iter()
            .filter_map(|n| match Node::try_from(n) {
                Ok(node) => Some(node),
                Err(e) => {
                    tracing::warn!(sender = %sender.id, "Skipping malformed node in query response: {}", e);
                    None
                }
            })
            .collect();
        Ok(Self { sender, nodes })
    }
}

/// Encode a Ping request from `sender`
pub fn encode_ping(request_id: u64, sender: &Node) -> Vec<u8> {
    proto::ping_request(request_id, sender).to_bytes()
}

/// Encode a Query request
pub fn encode_query(request_id: u64, request: &QueryRequest) -> Vec<u8> {
    proto::query_request(request_id, request.into()).to_bytes()
}

fn open_reply(bytes: &[u8], request_id: u64) -> Result<Payload> {
    let envelope = Envelope::from_bytes(bytes).map_err(|e| protocol("failed to decode reply", e))?;

    if envelope.request_id != request_id {
        tracing::warn!(
            "Request ID mismatch: expected {}, got {}",
            request_id,
            envelope.request_id
        );
    }

    match envelope.payload {
        Some(Payload::ErrorResponse(err)) => Err(DhtError::Remote {
            code: err.code,
            message: err.message,
        }),
        Some(payload) => Ok(payload),
        None => Err(DhtError::Protocol("reply without payload".to_string())),
    }
}

/// Decode the reply to a Ping, returning the responder
pub fn parse_ping_reply(bytes: &[u8], request_id: u64) -> Result<Node> {
    match open_reply(bytes, request_id)? {
        Payload::PingResponse(resp) => node_from_wire(resp.responder, "responder"),
        _ => Err(DhtError::Protocol("unexpected reply to ping".to_string())),
    }
}

/// Decode the reply to a Query
pub fn parse_query_reply(bytes: &[u8], request_id: u64) -> Result<QueryResponse> {
    match open_reply(bytes, request_id)? {
        Payload::QueryResponse(resp) => QueryResponse::try_from(resp),
        _ => Err(DhtError::Protocol("unexpected reply to query".to_string())),
    }
}

/// Outgoing RPCs to remote nodes
///
/// Implementations only move bytes; deadlines and cancellation are applied
/// by the caller through `RequestContext`.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Liveness probe, returning the node that answered
    async fn ping(&self, to: &Node) -> Result<Node>;

    async fn query(&self, to: &Node, request: QueryRequest) -> Result<QueryResponse>;
}

/// In-process network for tests
pub mod mock {
    use super::*;
    use crate::node::Kademlia;
    use crate::server::MessageHandler;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex, PoisonError, Weak};
    use std::time::Duration;

    /// Routes requests by address to registered nodes
    ///
    /// Nodes are held weakly; a dropped node behaves like a closed port.
    #[derive(Default)]
    pub struct MockNetwork {
        nodes: Mutex<HashMap<String, Weak<Kademlia<MockClient>>>>,
        unreachable: Mutex<HashSet<String>>,
        latency: Mutex<HashMap<String, Duration>>,
        requests: AtomicUsize,
    }

    impl MockNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A client that sends as `local`
        pub fn client(self: &Arc<Self>, local: Node) -> MockClient {
            MockClient {
                network: Arc::clone(self),
                local,
            }
        }

        /// Make `node` answer requests sent to its address
        pub fn register(&self, node: &Arc<Kademlia<MockClient>>) {
            if let Some(address) = &node.local().address {
                self.nodes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(address.address.clone(), Arc::downgrade(node));
            }
        }

        pub fn unregister(&self, address: &str) {
            self.nodes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(address);
        }

        /// Refuse every request to `address` while set
        pub fn set_unreachable(&self, address: &str, unreachable: bool) {
            let mut set = self.unreachable.lock().unwrap_or_else(PoisonError::into_inner);
            if unreachable {
                set.insert(address.to_string());
            } else {
                set.remove(address);
            }
        }

        /// Delay every request to `address`
        pub fn set_latency(&self, address: &str, latency: Duration) {
            self.latency
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(address.to_string(), latency);
        }

        /// Requests delivered or attempted so far
        pub fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        async fn deliver(&self, to: &Node, request: Vec<u8>) -> Result<Vec<u8>> {
            self.requests.fetch_add(1, Ordering::SeqCst);

            let address = to
                .address
                .as_ref()
                .map(|a| a.address.clone())
                .ok_or_else(|| DhtError::Network(format!("{} has no address", to.id)))?;

            let refused = self
                .unreachable
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&address);
            if refused {
                return Err(DhtError::Network(format!("connection to {} refused", address)));
            }

            let latency = self
                .latency
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&address)
                .copied();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let node = self
                .nodes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&address)
                .and_then(Weak::upgrade)
                .ok_or_else(|| DhtError::Network(format!("nothing listening on {}", address)))?;

            Ok(MessageHandler::new(node).handle(&request).await)
        }
    }

    /// [`NodeClient`] over a [`MockNetwork`]
    pub struct MockClient {
        network: Arc<MockNetwork>,
        local: Node,
    }

    #[async_trait]
    impl NodeClient for MockClient {
        async fn ping(&self, to: &Node) -> Result<Node> {
            let request_id = next_request_id();
            let reply = self
                .network
                .deliver(to, encode_ping(request_id, &self.local))
                .await?;
            parse_ping_reply(&reply, request_id)
        }

        async fn query(&self, to: &Node, request: QueryRequest) -> Result<QueryResponse> {
            let request_id = next_request_id();
            let reply = self
                .network
                .deliver(to, encode_query(request_id, &request))
                .await?;
            parse_query_reply(&reply, request_id)
        }
    }
}
