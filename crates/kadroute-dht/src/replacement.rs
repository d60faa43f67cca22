//! Replacement cache for full buckets
//!
//! Candidates that arrive for a full bucket that cannot split are parked
//! here, oldest first, and used to backfill the bucket when a member is
//! evicted.

use crate::partition::BucketId;
use kadroute_core::{Node, NodeId};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct ReplacementCache {
    /// Maximum candidates per bucket
    capacity: usize,
    entries: HashMap<BucketId, VecDeque<Node>>,
}

impl ReplacementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a candidate for `bucket`
    ///
    /// A candidate already cached moves to the newest position. Returns the
    /// oldest entry if it had to be evicted to stay within capacity.
    pub fn push(&mut self, bucket: &BucketId, node: Node) -> Option<Node> {
        if self.capacity == 0 {
            return Some(node);
        }

        let candidates = self.entries.entry(bucket.clone()).or_default();
        if let Some(pos) = candidates.iter().position(|n| n.id == node.id) {
            candidates.remove(pos);
        }
        candidates.push_back(node);

        if candidates.len() > self.capacity {
            candidates.pop_front()
        } else {
            None
        }
    }

    /// Take the most recently added candidate for `bucket`
    pub fn pop_newest(&mut self, bucket: &BucketId) -> Option<Node> {
        let candidates = self.entries.get_mut(bucket)?;
        let node = candidates.pop_back();
        if candidates.is_empty() {
            self.entries.remove(bucket);
        }
        node
    }

    /// Drop a candidate wherever it is cached
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let mut removed = false;
        self.entries.retain(|_, candidates| {
            let before = candidates.len();
            candidates.retain(|n| &n.id != id);
            removed |= candidates.len() != before;
            !candidates.is_empty()
        });
        removed
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries
            .values()
            .any(|candidates| candidates.iter().any(|n| &n.id == id))
    }

    /// Candidates for `bucket`, oldest first
    pub fn get(&self, bucket: &BucketId) -> Vec<Node> {
        self.entries
            .get(bucket)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Move candidates that now fall into the new `lower` bucket after
    /// `upper` was split
    pub fn split(&mut self, upper: &BucketId, lower: &BucketId) {
        let Some(candidates) = self.entries.remove(upper) else {
            return;
        };

        let (low, high): (VecDeque<Node>, VecDeque<Node>) = candidates
            .into_iter()
            .partition(|n| n.id.as_bytes() <= lower.as_bytes());

        if !low.is_empty() {
            self.entries.insert(lower.clone(), low);
        }
        if !high.is_empty() {
            self.entries.insert(upper.clone(), high);
        }
    }

    /// Total number of cached candidates
    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
