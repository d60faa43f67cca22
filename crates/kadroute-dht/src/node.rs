//! DHT node: the routing table plus a network client

use crate::config::DhtConfig;
use crate::context::RequestContext;
use crate::partition;
use crate::routing::RoutingTable;
use crate::rpc::{NodeClient, QueryRequest, QueryResponse};
use crate::{DhtError, Result};
use kadroute_core::{Node, NodeId};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A participant in the DHT
pub struct Kademlia<C> {
    pub(crate) table: Arc<RoutingTable>,
    pub(crate) client: Arc<C>,
    pub(crate) config: DhtConfig,
    pub(crate) span: tracing::Span,
}

impl<C: NodeClient> Kademlia<C> {
    pub fn new(table: Arc<RoutingTable>, client: C, config: DhtConfig) -> Self {
        let span = tracing::info_span!("dht", node = %table.local().id);
        Self {
            table,
            client: Arc::new(client),
            config,
            span,
        }
    }

    /// Our own node
    pub fn local(&self) -> &Node {
        self.table.local()
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Join the network through `seeds`
    ///
    /// Every seed is pinged; unreachable seeds are skipped. If at least one
    /// answers, a lookup for our own ID fills the table with nearby nodes.
    /// Returns the number of seeds that answered.
    pub async fn bootstrap(&self, seeds: &[Node], ctx: &RequestContext) -> Result<usize> {
        async move {
            let seeds: Vec<&Node> = seeds
                .iter()
                .filter(|s| s.id != self.local().id)
                .collect();
            if seeds.is_empty() {
                tracing::info!("No seed nodes given, starting a new network");
                return Ok(0);
            }

            let mut reached = 0;
            for seed in &seeds {
                match self.ping(seed, ctx).await {
                    Ok(_) => reached += 1,
                    Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                    Err(e) => tracing::warn!("Seed {} unreachable: {}", seed, e),
                }
            }
            if reached == 0 {
                return Err(DhtError::BootstrapFailed {
                    attempted: seeds.len(),
                });
            }

            match self.lookup(&self.local().id, ctx).await {
                Ok(outcome) => tracing::debug!(
                    queried = outcome.queried,
                    rounds = outcome.rounds,
                    "Self lookup complete"
                ),
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(e) => tracing::warn!("Self lookup after bootstrap failed: {}", e),
            }

            tracing::info!(
                seeds = reached,
                known = self.table.node_count()?,
                "Bootstrap complete"
            );
            Ok(reached)
        }
        .instrument(self.span.clone())
        .await
    }

    /// Liveness probe
    ///
    /// An answer refreshes (or admits) the responder; a failure counts
    /// towards evicting `node`. A node with an empty ID accepts any
    /// responder, which lets seeds be given by address alone.
    pub async fn ping(&self, node: &Node, ctx: &RequestContext) -> Result<Node> {
        let ctx = ctx.child(Some(self.config.request_timeout()));
        let result = ctx
            .run(self.client.ping(node))
            .instrument(self.span.clone())
            .await
            .and_then(|responder| {
                if !node.id.is_empty() && responder.id != node.id {
                    return Err(DhtError::Protocol(format!(
                        "expected {} but {} answered",
                        node.id, responder.id
                    )));
                }
                Ok(responder)
            });

        match result {
            Ok(responder) => {
                self.table.connection_success(&responder)?;
                Ok(responder)
            }
            Err(DhtError::Cancelled) => Err(DhtError::Cancelled),
            Err(e) => {
                if !node.id.is_empty() {
                    let status = self.table.connection_failed(&node.id)?;
                    tracing::debug!(parent: &self.span, node = %node.id, ?status, "Ping failed: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Locate `target`, answering from the table when it is already known
    pub async fn find_node(&self, target: &NodeId, ctx: &RequestContext) -> Result<Node> {
        if let Some(node) = self.table.get_node(target)? {
            return Ok(node);
        }
        self.lookup(target, ctx)
            .await?
            .found
            .ok_or(DhtError::NodeNotFound)
    }

    /// Serve a Query
    ///
    /// With `pingback` set the sender is pinged before it is trusted; a
    /// failed pingback fails the query.
    pub async fn handle_query(&self, request: QueryRequest, ctx: &RequestContext) -> Result<QueryResponse> {
        if request.target.len() != self.table.id_length() {
            return Err(DhtError::Protocol(format!(
                "target has {} bytes, expected {}",
                request.target.len(),
                self.table.id_length()
            )));
        }

        if request.pingback && request.sender.id != self.local().id {
            match self.ping(&request.sender, ctx).await {
                Ok(_) => {}
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(e) => {
                    tracing::debug!(parent: &self.span, sender = %request.sender.id, "Pingback failed: {}", e);
                    return Err(DhtError::PingbackFailed(request.sender.id));
                }
            }
        }

        let limit = if request.limit == 0 {
            self.table.k()
        } else {
            request.limit
        };
        let nodes = self.table.find_near(&request.target, limit)?;
        Ok(QueryResponse {
            sender: self.local().clone(),
            nodes,
        })
    }

    /// Look up a random ID in every bucket not updated within `max_age`
    ///
    /// Returns the number of buckets refreshed.
    pub async fn refresh_buckets(&self, max_age: Duration, ctx: &RequestContext) -> Result<usize> {
        let now = SystemTime::now();
        let stale: Vec<_> = self
            .table
            .get_buckets()?
            .into_iter()
            .filter(|b| {
                now.duration_since(b.last_updated)
                    .map(|age| age >= max_age)
                    .unwrap_or(false)
            })
            .collect();

        let mut refreshed = 0;
        for bucket in stale {
            ctx.check()?;
            let target = partition::random_id_in_bucket(&bucket.range)?;
            match self.lookup(&target, ctx).await {
                Ok(_) => {}
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(e @ DhtError::Unreachable { .. }) => {
                    tracing::debug!(parent: &self.span, bucket = %bucket.id, "Refresh lookup failed: {}", e)
                }
                Err(e) if e.is_network() => {
                    tracing::debug!(parent: &self.span, bucket = %bucket.id, "Refresh lookup failed: {}", e)
                }
                Err(e) => return Err(e),
            }
            self.table.set_bucket_timestamp(&bucket.id, SystemTime::now())?;
            refreshed += 1;
        }
        Ok(refreshed)
    }

    /// Refresh stale buckets every `interval` until `ctx` is cancelled
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, ctx: RequestContext) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match node.refresh_buckets(interval, &ctx.child(None)).await {
                        Ok(0) => {}
                        Ok(refreshed) => tracing::debug!(refreshed, "Refreshed stale buckets"),
                        Err(DhtError::Cancelled) => break,
                        Err(e) => tracing::warn!("Bucket refresh failed: {}", e),
                    }
                }
                tracing::debug!("Refresh task stopped");
            }
            .instrument(span),
        )
    }
}
