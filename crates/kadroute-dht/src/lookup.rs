//! Iterative node lookup
//!
//! Each round queries, in parallel, up to `k` shortlist entries that have
//! not been asked yet. Answers are merged into the shortlist, which keeps
//! the `k` closest known nodes to the target. The search ends when the
//! target shows up, or after one last sweep of the remaining unqueried
//! entries once a round fails to bring anything closer.

use crate::context::RequestContext;
use crate::distance::{cmp_distance, sort_nodes_by_xor};
use crate::node::Kademlia;
use crate::rpc::{NodeClient, QueryRequest, QueryResponse};
use crate::{DhtError, Result};
use kadroute_core::{Node, NodeId};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Result of a finished lookup
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub target: NodeId,
    /// The target itself, if some node knew it
    pub found: Option<Node>,
    /// Closest nodes still in the shortlist, nearest first
    pub closest: Vec<Node>,
    /// Number of Query RPCs sent
    pub queried: usize,
    pub rounds: usize,
}

/// Closest known nodes to a target
#[derive(Debug)]
struct Shortlist {
    target: NodeId,
    local: NodeId,
    k: usize,
    /// Sorted by distance to `target`, at most `k` long
    entries: Vec<Node>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
}

impl Shortlist {
    fn new(target: NodeId, local: NodeId, k: usize) -> Self {
        Self {
            target,
            local,
            k,
            entries: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Add nodes we have not seen, keeping the closest `k`
    ///
    /// Returns how many new entries survived the cut.
    fn merge(&mut self, nodes: impl IntoIterator<Item = Node>) -> usize {
        let mut added = Vec::new();
        for node in nodes {
            if node.id == self.local
                || node.id.len() != self.target.len()
                || self.failed.contains(&node.id)
                || self.entries.iter().any(|e| e.id == node.id)
                || added.iter().any(|id: &NodeId| id == &node.id)
            {
                continue;
            }
            added.push(node.id.clone());
            self.entries.push(node);
        }

        sort_nodes_by_xor(&mut self.entries, &self.target);
        self.entries.truncate(self.k);
        added
            .iter()
            .filter(|id| self.entries.iter().any(|e| &e.id == *id))
            .count()
    }

    /// Up to `width` entries not yet queried, closest first; they are
    /// marked queried
    fn next_batch(&mut self, width: usize) -> Vec<Node> {
        let batch: Vec<Node> = self
            .entries
            .iter()
            .filter(|n| !self.queried.contains(&n.id))
            .take(width)
            .cloned()
            .collect();
        for node in &batch {
            self.queried.insert(node.id.clone());
        }
        batch
    }

    /// Drop an unresponsive node for the rest of this search
    fn mark_failed(&mut self, id: &NodeId) {
        self.failed.insert(id.clone());
        self.entries.retain(|n| &n.id != id);
    }

    fn closest(&self) -> Option<&NodeId> {
        self.entries.first().map(|n| &n.id)
    }

    fn find(&self, id: &NodeId) -> Option<&Node> {
        self.entries.iter().find(|n| &n.id == id)
    }

    fn into_entries(self) -> Vec<Node> {
        self.entries
    }
}

/// Whether `candidate` is strictly closer to `target` than `best`
fn is_closer(candidate: Option<&NodeId>, best: Option<&NodeId>, target: &NodeId) -> bool {
    match (candidate, best) {
        (Some(c), Some(b)) => cmp_distance(c.as_bytes(), b.as_bytes(), target.as_bytes()) == Ordering::Less,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl<C: NodeClient> Kademlia<C> {
    /// Iteratively search the network for the nodes closest to `target`
    ///
    /// Unreachable peers are skipped; the search only fails with
    /// `Unreachable` when every contacted peer failed.
    pub async fn lookup(&self, target: &NodeId, ctx: &RequestContext) -> Result<LookupOutcome> {
        let span = tracing::debug_span!(parent: &self.span, "lookup", target = %target);
        async move {
            let k = self.table.k();
            let mut shortlist = Shortlist::new(target.clone(), self.local().id.clone(), k);
            shortlist.merge(self.table.find_near(target, k)?);

            let mut best = shortlist.closest().cloned();
            let mut queried = 0;
            let mut failures = 0;
            let mut rounds = 0;
            let mut last_sweep = false;

            while shortlist.find(target).is_none() {
                ctx.check()?;
                let batch = shortlist.next_batch(k);
                if batch.is_empty() {
                    break;
                }
                rounds += 1;

                for (node, result) in self.query_round(batch, target, ctx).await {
                    queried += 1;
                    let result = result.and_then(|resp| {
                        if resp.sender.id != node.id {
                            return Err(DhtError::Protocol(format!(
                                "queried {} but {} answered",
                                node.id, resp.sender.id
                            )));
                        }
                        Ok(resp)
                    });
                    match result {
                        Ok(resp) => {
                            self.table.connection_success(&node)?;
                            let added = shortlist.merge(resp.nodes);
                            tracing::trace!(node = %node.id, added, "Query answered");
                        }
                        Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                        Err(e) => {
                            failures += 1;
                            shortlist.mark_failed(&node.id);
                            let status = self.table.connection_failed(&node.id)?;
                            tracing::debug!(node = %node.id, ?status, "Query failed: {}", e);
                        }
                    }
                }

                if last_sweep {
                    break;
                }
                let closest = shortlist.closest().cloned();
                if is_closer(closest.as_ref(), best.as_ref(), target) {
                    best = closest;
                } else {
                    last_sweep = true;
                }
            }

            let found = shortlist.find(target).cloned();
            if found.is_none() && queried > 0 && failures == queried {
                return Err(DhtError::Unreachable { attempted: queried });
            }

            tracing::debug!(queried, rounds, found = found.is_some(), "Lookup finished");
            Ok(LookupOutcome {
                target: target.clone(),
                found,
                closest: shortlist.into_entries(),
                queried,
                rounds,
            })
        }
        .instrument(span)
        .await
    }

    /// Query every node of `batch` concurrently and wait for all answers
    async fn query_round(
        &self,
        batch: Vec<Node>,
        target: &NodeId,
        ctx: &RequestContext,
    ) -> Vec<(Node, Result<QueryResponse>)> {
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        for node in batch {
            let client = Arc::clone(&self.client);
            let request = QueryRequest {
                sender: self.local().clone(),
                target: target.clone(),
                limit: self.table.k(),
                pingback: self.config.pingback,
            };
            let ctx = ctx.child(Some(self.config.request_timeout()));
            let queried = node.clone();
            let handle = tasks.spawn(
                async move { ctx.run(client.query(&queried, request)).await }.in_current_span(),
            );
            pending.insert(handle.id(), node);
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => {
                    tracing::warn!("Query task failed: {}", e);
                    (e.id(), Err(DhtError::Network(format!("query task failed: {}", e))))
                }
            };
            if let Some(node) = pending.remove(&id) {
                results.push((node, result));
            }
        }
        results
    }
}
