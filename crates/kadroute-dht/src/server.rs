//! Message handler for incoming DHT requests
//!
//! Decodes request envelopes, routes them to the node and encodes the reply.

use crate::context::RequestContext;
use crate::node::Kademlia;
use crate::rpc::{NodeClient, QueryRequest};
use crate::DhtError;
use kadroute_core::proto::{self, error_codes, Envelope, Payload};
use std::sync::Arc;

/// Handler for processing protocol messages
pub struct MessageHandler<C> {
    node: Arc<Kademlia<C>>,
}

impl<C: NodeClient> MessageHandler<C> {
    pub fn new(node: Arc<Kademlia<C>>) -> Self {
        Self { node }
    }

    /// Process an incoming message and return the encoded reply
    pub async fn handle(&self, data: &[u8]) -> Vec<u8> {
        let envelope = match Envelope::from_bytes(data) {
            Ok(env) => env,
            Err(kadroute_core::Error::VersionMismatch { expected, actual }) => {
                tracing::warn!("Rejecting message with protocol version {}", actual);
                return proto::error_response(
                    0,
                    error_codes::VERSION_MISMATCH,
                    format!("expected protocol version {}, got {}", expected, actual),
                )
                .to_bytes();
            }
            Err(e) => {
                tracing::warn!("Failed to decode message: {}", e);
                return proto::error_response(
                    0,
                    error_codes::INVALID_MESSAGE,
                    format!("decode error: {}", e),
                )
                .to_bytes();
            }
        };

        let request_id = envelope.request_id;
        let response = match envelope.payload {
            Some(Payload::QueryRequest(req)) => self.handle_query(request_id, req).await,
            Some(Payload::PingRequest(req)) => {
                if let Some(sender) = &req.sender {
                    tracing::trace!("Ping from {}", hex::encode(&sender.id));
                }
                proto::ping_response(request_id, self.node.local())
            }
            Some(other) => {
                tracing::warn!("Unexpected message type: {:?}", other);
                proto::error_response(
                    request_id,
                    error_codes::INVALID_MESSAGE,
                    "unexpected message type".to_string(),
                )
            }
            None => {
                tracing::warn!("Empty payload in message");
                proto::error_response(
                    request_id,
                    error_codes::INVALID_MESSAGE,
                    "empty payload".to_string(),
                )
            }
        };

        response.to_bytes()
    }

    /// Handle a query request
    async fn handle_query(&self, request_id: u64, req: proto::QueryRequest) -> Envelope {
        let request = match QueryRequest::try_from(req) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Invalid query: {}", e);
                return proto::error_response(request_id, error_codes::INVALID_DATA, e.to_string());
            }
        };

        let ctx = RequestContext::with_timeout(self.node.config().request_timeout());
        match self.node.handle_query(request, &ctx).await {
            Ok(response) => proto::query_response(request_id, (&response).into()),
            Err(e) => {
                let code = match &e {
                    DhtError::Protocol(_) => error_codes::INVALID_DATA,
                    DhtError::PingbackFailed(_) | DhtError::Timeout | DhtError::Cancelled => {
                        error_codes::UNAVAILABLE
                    }
                    _ => {
                        tracing::error!("Failed to answer query: {}", e);
                        error_codes::INTERNAL
                    }
                };
                proto::error_response(request_id, code, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::routing::RoutingTable;
    use crate::rpc::mock::{MockClient, MockNetwork};
    use crate::rpc::{encode_ping, encode_query, parse_ping_reply, parse_query_reply};
    use kadroute_core::{Node, NodeId};

    fn config() -> DhtConfig {
        DhtConfig {
            id_length: 2,
            bucket_size: 4,
            pingback: false,
            ..Default::default()
        }
    }

    fn handler() -> (MessageHandler<MockClient>, Node) {
        let network = MockNetwork::new();
        let local = Node::with_tcp(NodeId::new(vec![0x80, 0x00]), "10.0.0.1:7000");
        let table = Arc::new(RoutingTable::in_memory(local.clone(), &config()).unwrap());
        for byte in [0x10u8, 0x20, 0x90] {
            table
                .add_node(Node::with_tcp(NodeId::new(vec![byte, 0x00]), format!("10.0.0.{}:7000", byte)))
                .unwrap();
        }
        let node = Arc::new(Kademlia::new(table, network.client(local.clone()), config()));
        (MessageHandler::new(node), local)
    }

    #[tokio::test]
    async fn test_ping_reports_local_node() {
        let (handler, local) = handler();
        let peer = Node::with_tcp(NodeId::new(vec![1, 1]), "10.0.0.9:7000");
        let reply = handler.handle(&encode_ping(11, &peer)).await;
        assert_eq!(parse_ping_reply(&reply, 11).unwrap(), local);
    }

    #[tokio::test]
    async fn test_query_returns_nearest() {
        let (handler, local) = handler();
        let request = QueryRequest {
            sender: Node::with_tcp(NodeId::new(vec![1, 1]), "10.0.0.9:7000"),
            target: NodeId::new(vec![0x11, 0x00]),
            limit: 2,
            pingback: false,
        };
        let reply = handler.handle(&encode_query(5, &request)).await;
        let response = parse_query_reply(&reply, 5).unwrap();
        assert_eq!(response.sender, local);
        let ids: Vec<Vec<u8>> = response.nodes.iter().map(|n| n.id.as_bytes().to_vec()).collect();
        assert_eq!(ids, vec![vec![0x10, 0x00], vec![0x20, 0x00]]);
    }

    #[tokio::test]
    async fn test_query_limit_zero_uses_bucket_size() {
        let (handler, _) = handler();
        let request = QueryRequest {
            sender: Node::with_tcp(NodeId::new(vec![1, 1]), "10.0.0.9:7000"),
            target: NodeId::new(vec![0x11, 0x00]),
            limit: 0,
            pingback: false,
        };
        let reply = handler.handle(&encode_query(5, &request)).await;
        assert_eq!(parse_query_reply(&reply, 5).unwrap().nodes.len(), 4);
    }

    #[tokio::test]
    async fn test_query_with_wrong_target_length() {
        let (handler, _) = handler();
        let request = QueryRequest {
            sender: Node::with_tcp(NodeId::new(vec![1, 1]), "10.0.0.9:7000"),
            target: NodeId::new(vec![0x11, 0x00, 0x00]),
            limit: 0,
            pingback: false,
        };
        let reply = handler.handle(&encode_query(5, &request)).await;
        assert!(matches!(
            parse_query_reply(&reply, 5),
            Err(DhtError::Remote { code: error_codes::INVALID_DATA, .. })
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_rejected() {
        let (handler, _) = handler();
        let reply = handler.handle(&[0xff, 0x01, 0x02]).await;
        let envelope = Envelope::from_bytes(&reply).unwrap();
        match envelope.payload {
            Some(Payload::ErrorResponse(err)) => assert_eq!(err.code, error_codes::INVALID_MESSAGE),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (handler, _) = handler();
        let mut envelope = proto::ping_request(1, &Node::new(NodeId::new(vec![1, 1]), None));
        envelope.version = 99;
        let reply = handler.handle(&envelope.to_bytes()).await;
        match Envelope::from_bytes(&reply).unwrap().payload {
            Some(Payload::ErrorResponse(err)) => assert_eq!(err.code, error_codes::VERSION_MISMATCH),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_message_type() {
        let (handler, local) = handler();
        let reply = handler
            .handle(&proto::ping_response(4, &local).to_bytes())
            .await;
        assert!(matches!(
            parse_ping_reply(&reply, 4),
            Err(DhtError::Remote { code: error_codes::INVALID_MESSAGE, .. })
        ));
    }
}
