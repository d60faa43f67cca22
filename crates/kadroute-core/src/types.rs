//! Core data types for kadroute

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An opaque fixed-length node identifier
///
/// Identifiers carry no total order of their own; proximity is only
/// meaningful through the XOR metric.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    /// Create a new NodeId from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the identifier as a byte slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to owned bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length of the identifier in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex encoding of the identifier
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse a hex-encoded identifier
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidData(format!("invalid node id {:?}: {}", s, e)))?;
        if bytes.is_empty() {
            return Err(Error::InvalidData("empty node id".to_string()));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl From<Vec<u8>> for NodeId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for NodeId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Transport used to reach a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
}

/// A network address of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(default)]
    pub transport: TransportKind,
    /// "host:port"
    pub address: String,
}

impl NodeAddress {
    /// Create a TCP address
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Tcp,
            address: address.into(),
        }
    }

    /// Split the address into host and port
    pub fn host_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in {:?}", self.address)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in {:?}", self.address)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidAddress(format!("bad port in {:?}: {}", self.address, e)))?;
        Ok((host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let address = NodeAddress::tcp(s);
        address.host_port()?;
        Ok(address)
    }
}

/// A peer in the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<NodeAddress>,
}

impl Node {
    pub fn new(id: NodeId, address: Option<NodeAddress>) -> Self {
        Self { id, address }
    }

    /// A node reachable over TCP at `address`
    pub fn with_tcp(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: Some(NodeAddress::tcp(address)),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(address) => write!(f, "{}@{}", self.id, address),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Generate a random node ID of `len` bytes
pub fn generate_random_node_id(len: usize) -> Result<NodeId> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(NodeId(bytes))
}
