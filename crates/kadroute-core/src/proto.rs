//! Protocol buffer message definitions
//!
//! These are manually defined to match the kadroute.proto schema,
//! avoiding the need for protoc at build time. This module is also the
//! only place where node records are (de)serialized: the routing table
//! stores the bytes produced by [`encode_node_record`].

use crate::types::{self, NodeAddress, NodeId, TransportKind};
use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 20, 21, 100")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    QueryRequest(QueryRequest),
    #[prost(message, tag = "11")]
    QueryResponse(QueryResponse),
    #[prost(message, tag = "20")]
    PingRequest(PingRequest),
    #[prost(message, tag = "21")]
    PingResponse(PingResponse),
    #[prost(message, tag = "100")]
    ErrorResponse(ErrorResponse),
}

// Node records

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NodeTransport {
    Tcp = 0,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProtoNodeAddress {
    #[prost(enumeration = "NodeTransport", tag = "1")]
    pub transport: i32,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Node {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub address: Option<ProtoNodeAddress>,
}

// DHT messages

#[derive(Clone, PartialEq, Message)]
pub struct QueryRequest {
    #[prost(message, optional, tag = "1")]
    pub sender: Option<Node>,
    #[prost(bytes, tag = "2")]
    pub target: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub limit: u32,
    #[prost(bool, tag = "4")]
    pub pingback: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryResponse {
    #[prost(message, optional, tag = "1")]
    pub sender: Option<Node>,
    #[prost(message, repeated, tag = "2")]
    pub response: Vec<Node>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {
    #[prost(message, optional, tag = "1")]
    pub sender: Option<Node>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {
    #[prost(message, optional, tag = "1")]
    pub responder: Option<Node>,
}

// Error message

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

impl From<TransportKind> for NodeTransport {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Tcp => NodeTransport::Tcp,
        }
    }
}

impl From<NodeTransport> for TransportKind {
    fn from(transport: NodeTransport) -> Self {
        match transport {
            NodeTransport::Tcp => TransportKind::Tcp,
        }
    }
}

impl From<&types::Node> for Node {
    fn from(node: &types::Node) -> Self {
        Self {
            id: node.id.as_bytes().to_vec(),
            address: node.address.as_ref().map(|a| ProtoNodeAddress {
                transport: NodeTransport::from(a.transport) as i32,
                address: a.address.clone(),
            }),
        }
    }
}

impl TryFrom<Node> for types::Node {
    type Error = Error;

    fn try_from(node: Node) -> Result<Self> {
        if node.id.is_empty() {
            return Err(Error::InvalidData("node record without id".to_string()));
        }
        let address = match node.address {
            Some(a) => {
                let transport = NodeTransport::try_from(a.transport).map_err(|_| {
                    Error::InvalidData(format!("unknown node transport {}", a.transport))
                })?;
                Some(NodeAddress {
                    transport: transport.into(),
                    address: a.address,
                })
            }
            None => None,
        };
        Ok(types::Node {
            id: NodeId::new(node.id),
            address,
        })
    }
}

/// Serialize a node for the `nodes` namespace
pub fn encode_node_record(node: &types::Node) -> Vec<u8> {
    Node::from(node).encode_to_vec()
}

/// Deserialize a node stored in the `nodes` namespace
pub fn decode_node_record(buf: &[u8]) -> Result<types::Node> {
    types::Node::try_from(Node::decode(buf)?)
}

/// Error codes
pub mod error_codes {
    // Protocol errors (1xx)
    pub const VERSION_MISMATCH: u32 = 100;
    pub const INVALID_MESSAGE: u32 = 101;

    // Resource errors (2xx)
    pub const NOT_FOUND: u32 = 200;
    pub const UNAVAILABLE: u32 = 201;

    // Validation errors (3xx)
    pub const INVALID_DATA: u32 = 301;

    // Internal errors (5xx)
    pub const INTERNAL: u32 = 500;
}

/// Helper functions to create common message types

pub fn query_request(request_id: u64, request: QueryRequest) -> Envelope {
    Envelope::new(request_id, Payload::QueryRequest(request))
}

pub fn query_response(request_id: u64, response: QueryResponse) -> Envelope {
    Envelope::new(request_id, Payload::QueryResponse(response))
}

pub fn ping_request(request_id: u64, sender: &types::Node) -> Envelope {
    Envelope::new(
        request_id,
        Payload::PingRequest(PingRequest {
            sender: Some(Node::from(sender)),
        }),
    )
}

pub fn ping_response(request_id: u64, responder: &types::Node) -> Envelope {
    Envelope::new(
        request_id,
        Payload::PingResponse(PingResponse {
            responder: Some(Node::from(responder)),
        }),
    )
}

pub fn error_response(request_id: u64, code: u32, message: String) -> Envelope {
    Envelope::new(
        request_id,
        Payload::ErrorResponse(ErrorResponse { code, message }),
    )
}
