//! Kademlia routing table implementation
//!
//! Buckets and node records live in two ordered key-value namespaces:
//! `kbuckets` maps each bucket boundary to its last-updated timestamp, and
//! `nodes` maps each node ID to its serialized record. Bucket membership is
//! never stored; it follows from which boundary range an ID falls into, so a
//! split only has to write the new lower boundary.
//!
//! All operations, reads included, run under one table lock so that a split
//! is never observed half done.

use crate::config::DhtConfig;
use crate::distance::{cmp_distance, sort_by_xor};
use crate::partition::{self, BucketId, KBucketRange};
use crate::replacement::ReplacementCache;
use crate::{DhtError, Result, RoutingError};
use kadroute_core::proto::{decode_node_record, encode_node_record};
use kadroute_core::{KeyValueStore, MemoryStore, Node, NodeId};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Liveness state of a remote node as seen by the local table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never admitted to the table
    Unknown,
    /// Member of a bucket with no outstanding failures
    Active,
    /// Member of a bucket whose last contact failed
    Stale,
    /// Waiting in a replacement cache
    Cached,
    /// Just removed after repeated failures
    Evicted,
}

/// Snapshot of one bucket
#[derive(Debug, Clone)]
pub struct KBucket {
    pub id: BucketId,
    pub range: KBucketRange,
    pub nodes: Vec<Node>,
    pub last_updated: SystemTime,
}

struct TableState {
    kbuckets: Box<dyn KeyValueStore>,
    nodes: Box<dyn KeyValueStore>,
    cache: ReplacementCache,
    /// Consecutive liveness failures per member
    failures: HashMap<NodeId, u32>,
}

/// Kademlia routing table
pub struct RoutingTable {
    /// Our own node
    local: Node,
    id_length: usize,
    /// K parameter
    bucket_size: usize,
    eviction_threshold: u32,
    state: Mutex<TableState>,
}

fn encode_timestamp(time: SystemTime) -> [u8; 8] {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis.to_be_bytes()
}

fn decode_timestamp(bucket: &BucketId, value: &[u8]) -> Result<SystemTime> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        RoutingError::MalformedRecord(format!(
            "timestamp of bucket {} has {} bytes",
            bucket,
            value.len()
        ))
    })?;
    Ok(UNIX_EPOCH + Duration::from_millis(u64::from_be_bytes(bytes)))
}

/// Swallow not-found so callers can branch on presence
fn optional(result: kadroute_core::Result<Vec<u8>>) -> Result<Option<Vec<u8>>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl RoutingTable {
    /// Open a routing table over the given namespaces
    ///
    /// An empty `kbuckets` namespace is initialized with the single root
    /// bucket; an existing partition is validated and kept. The local node
    /// is always (re)stored, splitting its bucket if that bucket is full.
    pub fn new(
        local: Node,
        config: &DhtConfig,
        kbuckets: Box<dyn KeyValueStore>,
        nodes: Box<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        if local.id.len() != config.id_length {
            return Err(RoutingError::IdLength {
                expected: config.id_length,
                actual: local.id.len(),
            }
            .into());
        }

        let table = Self {
            local,
            id_length: config.id_length,
            bucket_size: config.bucket_size,
            eviction_threshold: config.eviction_threshold,
            state: Mutex::new(TableState {
                kbuckets,
                nodes,
                cache: ReplacementCache::new(config.replacement_cache_size),
                failures: HashMap::new(),
            }),
        };

        {
            let mut state = table.lock();
            let boundaries = table.bucket_ids(&state)?;
            match boundaries.last() {
                None => {
                    let root = BucketId::first(table.id_length);
                    table.create_or_update_kbucket_locked(&mut state, &root, SystemTime::now())?;
                }
                Some(last) if !last.is_first() => {
                    return Err(RoutingError::MalformedRecord(format!(
                        "stored partition ends at {} instead of the all-ones boundary",
                        last
                    ))
                    .into());
                }
                Some(_) => {
                    if let Some(bad) = boundaries.iter().find(|b| b.as_bytes().len() != table.id_length) {
                        return Err(RoutingError::MalformedRecord(format!(
                            "stored bucket {} does not match the {}-byte id length",
                            bad, table.id_length
                        ))
                        .into());
                    }
                    tracing::debug!(buckets = boundaries.len(), "reusing stored partition");
                }
            }
            // A reopened table may have been filled around another local
            // ID, so the local node takes the split path like any other.
            let local = table.local.clone();
            if !table.add_node_locked(&mut state, local)? {
                return Err(RoutingError::MalformedRecord(format!(
                    "no room for the local node {} in the stored partition",
                    table.local.id
                ))
                .into());
            }
        }

        Ok(table)
    }

    /// A routing table backed by in-memory stores
    pub fn in_memory(local: Node, config: &DhtConfig) -> Result<Self> {
        Self::new(
            local,
            config,
            Box::new(MemoryStore::new()),
            Box::new(MemoryStore::new()),
        )
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // Guarded state is consistent between store calls, so a panicked
        // holder leaves nothing half-written in memory.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Our own node
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// K parameter (nodes per bucket)
    pub fn k(&self) -> usize {
        self.bucket_size
    }

    /// Replacement candidates kept per bucket
    pub fn cache_size(&self) -> usize {
        self.lock().cache.capacity()
    }

    pub fn id_length(&self) -> usize {
        self.id_length
    }

    fn id_bits(&self) -> usize {
        self.id_length * 8
    }

    fn check_id(&self, id: &NodeId) -> Result<()> {
        if id.len() != self.id_length {
            return Err(RoutingError::IdLength {
                expected: self.id_length,
                actual: id.len(),
            }
            .into());
        }
        Ok(())
    }

    // Public operations

    /// Add a node to the bucket its ID falls into
    ///
    /// Returns `Ok(false)` when the bucket is full and cannot split; the
    /// node is then held in that bucket's replacement cache instead.
    pub fn add_node(&self, node: Node) -> Result<bool> {
        let mut state = self.lock();
        self.add_node_locked(&mut state, node)
    }

    /// Overwrite the record of an existing member
    pub fn update_node(&self, node: Node) -> Result<()> {
        let mut state = self.lock();
        self.update_node_locked(&mut state, &node)
    }

    /// Remove a member, backfilling its slot from the replacement cache
    ///
    /// Removing an unknown node is a no-op. The local node is never removed.
    pub fn remove_node(&self, id: &NodeId) -> Result<()> {
        let mut state = self.lock();
        self.remove_node_locked(&mut state, id)
    }

    /// Bucket whose range contains `id`
    pub fn get_kbucket_id(&self, id: &NodeId) -> Result<BucketId> {
        let state = self.lock();
        self.get_kbucket_id_locked(&state, id.as_bytes())
    }

    /// `(previous boundary, bucket]`
    pub fn get_kbucket_range(&self, bucket: &BucketId) -> Result<KBucketRange> {
        let state = self.lock();
        self.get_kbucket_range_locked(&state, bucket)
    }

    /// IDs stored in `bucket`, ascending
    pub fn get_node_ids_within_kbucket(&self, bucket: &BucketId) -> Result<Vec<NodeId>> {
        let state = self.lock();
        let range = self.get_kbucket_range_locked(&state, bucket)?;
        self.node_ids_within(&state, &range)
    }

    /// Decoded node records stored in `bucket`, ascending by ID
    pub fn get_unmarshaled_nodes_from_bucket(&self, bucket: &BucketId) -> Result<Vec<Node>> {
        let state = self.lock();
        let range = self.get_kbucket_range_locked(&state, bucket)?;
        let ids = self.node_ids_within(&state, &range)?;
        self.get_nodes_from_ids_locked(&state, &ids)
    }

    /// Decoded node records for `ids`, in the given order
    pub fn get_nodes_from_ids(&self, ids: &[NodeId]) -> Result<Vec<Node>> {
        let state = self.lock();
        self.get_nodes_from_ids_locked(&state, ids)
    }

    /// Whether `id` would rank among the `k` known IDs nearest to us
    pub fn node_is_within_nearest_k(&self, id: &NodeId) -> Result<bool> {
        let state = self.lock();
        self.node_is_within_nearest_k_locked(&state, id)
    }

    /// The ID at the edge of the nearest-k window around the local node
    ///
    /// With `k` or fewer candidates besides ourselves this is simply the
    /// furthest candidate.
    pub fn determine_furthest_id_within_k(&self, ids: &[NodeId]) -> Option<NodeId> {
        let mut sorted = ids.to_vec();
        sort_by_xor(&mut sorted, &self.local.id);
        // The local node itself occupies the first slot.
        if sorted.len() < self.bucket_size + 1 {
            sorted.pop()
        } else {
            Some(sorted.swap_remove(self.bucket_size))
        }
    }

    /// Idempotently record `bucket` with the given last-updated time
    pub fn create_or_update_kbucket(&self, bucket: &BucketId, timestamp: SystemTime) -> Result<()> {
        let mut state = self.lock();
        self.create_or_update_kbucket_locked(&mut state, bucket, timestamp)
    }

    pub fn kbucket_contains_local_node(&self, bucket: &BucketId) -> Result<bool> {
        let state = self.lock();
        let range = self.get_kbucket_range_locked(&state, bucket)?;
        Ok(range.contains(self.local.id.as_bytes()))
    }

    pub fn kbucket_has_room(&self, bucket: &BucketId) -> Result<bool> {
        let state = self.lock();
        let range = self.get_kbucket_range_locked(&state, bucket)?;
        Ok(self.node_ids_within(&state, &range)?.len() < self.bucket_size)
    }

    /// Number of bits fixed by the splits that produced `bucket`
    pub fn determine_leaf_depth(&self, bucket: &BucketId) -> Result<usize> {
        let range = self.get_kbucket_range(bucket)?;
        partition::determine_leaf_depth(&range)
    }

    /// Up to `limit` known nodes nearest to `target`
    pub fn find_near(&self, target: &NodeId, limit: usize) -> Result<Vec<Node>> {
        let state = self.lock();
        let mut ids = self.all_node_ids(&state)?;
        sort_by_xor(&mut ids, target);
        ids.truncate(limit);
        self.get_nodes_from_ids_locked(&state, &ids)
    }

    /// The stored record for `id`, if it is a member
    pub fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        let state = self.lock();
        optional(state.nodes.get(id.as_bytes()))?
            .map(|value| self.decode(id, &value))
            .transpose()
    }

    /// Number of stored node records, the local node included
    pub fn node_count(&self) -> Result<usize> {
        let state = self.lock();
        Ok(state.nodes.list(None, 0)?.len())
    }

    /// Snapshot of every bucket, ascending
    pub fn get_buckets(&self) -> Result<Vec<KBucket>> {
        let state = self.lock();
        let mut buckets = Vec::new();
        let mut previous = None;
        for id in self.bucket_ids(&state)? {
            let range = KBucketRange::new(previous.take(), id.clone());
            let ids = self.node_ids_within(&state, &range)?;
            let nodes = self.get_nodes_from_ids_locked(&state, &ids)?;
            let last_updated = decode_timestamp(&id, &state.kbuckets.get(id.as_bytes())?)?;
            previous = Some(id.clone());
            buckets.push(KBucket {
                id,
                range,
                nodes,
                last_updated,
            });
        }
        Ok(buckets)
    }

    /// Last time `bucket` saw a successful update
    pub fn bucket_timestamp(&self, bucket: &BucketId) -> Result<SystemTime> {
        let state = self.lock();
        let value = optional(state.kbuckets.get(bucket.as_bytes()))?
            .ok_or_else(|| RoutingError::BucketNotFound(bucket.to_hex()))?;
        decode_timestamp(bucket, &value)
    }

    /// Set the timestamp of an existing bucket
    pub fn set_bucket_timestamp(&self, bucket: &BucketId, timestamp: SystemTime) -> Result<()> {
        let mut state = self.lock();
        if optional(state.kbuckets.get(bucket.as_bytes()))?.is_none() {
            return Err(RoutingError::BucketNotFound(bucket.to_hex()).into());
        }
        self.create_or_update_kbucket_locked(&mut state, bucket, timestamp)
    }

    /// Replacement candidates cached for `bucket`, oldest first
    pub fn replacement_candidates(&self, bucket: &BucketId) -> Vec<Node> {
        self.lock().cache.get(bucket)
    }

    /// A node answered us: refresh it, or try to admit it
    pub fn connection_success(&self, node: &Node) -> Result<NodeStatus> {
        if node.id == self.local.id {
            return Ok(NodeStatus::Active);
        }
        self.check_id(&node.id)?;

        let mut state = self.lock();
        state.failures.remove(&node.id);

        if optional(state.nodes.get(node.id.as_bytes()))?.is_some() {
            self.update_node_locked(&mut state, node)?;
            let bucket = self.get_kbucket_id_locked(&state, node.id.as_bytes())?;
            self.create_or_update_kbucket_locked(&mut state, &bucket, SystemTime::now())?;
            return Ok(NodeStatus::Active);
        }

        if self.add_node_locked(&mut state, node.clone())? {
            Ok(NodeStatus::Active)
        } else if state.cache.contains(&node.id) {
            Ok(NodeStatus::Cached)
        } else {
            Ok(NodeStatus::Unknown)
        }
    }

    /// A node failed to answer: mark it stale, evicting it once it has
    /// failed `eviction_threshold` times in a row
    pub fn connection_failed(&self, id: &NodeId) -> Result<NodeStatus> {
        if id == &self.local.id {
            return Ok(NodeStatus::Active);
        }

        let mut state = self.lock();
        if optional(state.nodes.get(id.as_bytes()))?.is_none() {
            if state.cache.remove(id) {
                tracing::debug!(node = %id, "dropped unresponsive replacement candidate");
            }
            return Ok(NodeStatus::Unknown);
        }

        let failures = state.failures.entry(id.clone()).or_insert(0);
        *failures += 1;
        let failures = *failures;

        if failures >= self.eviction_threshold {
            self.remove_node_locked(&mut state, id)?;
            tracing::debug!(node = %id, failures, "evicted unresponsive node");
            Ok(NodeStatus::Evicted)
        } else {
            tracing::debug!(node = %id, failures, "node marked stale");
            Ok(NodeStatus::Stale)
        }
    }

    /// Current liveness state of `id`
    pub fn status(&self, id: &NodeId) -> Result<NodeStatus> {
        let state = self.lock();
        if optional(state.nodes.get(id.as_bytes()))?.is_some() {
            if state.failures.contains_key(id) {
                Ok(NodeStatus::Stale)
            } else {
                Ok(NodeStatus::Active)
            }
        } else if state.cache.contains(id) {
            Ok(NodeStatus::Cached)
        } else {
            Ok(NodeStatus::Unknown)
        }
    }

    /// Close both namespaces
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.kbuckets.close()?;
        state.nodes.close()?;
        Ok(())
    }

    // Locked helpers

    fn add_node_locked(&self, state: &mut TableState, node: Node) -> Result<bool> {
        self.check_id(&node.id)?;
        let now = SystemTime::now();

        if optional(state.nodes.get(node.id.as_bytes()))?.is_some() {
            let bucket = self.get_kbucket_id_locked(state, node.id.as_bytes())?;
            self.put_node(state, &node)?;
            self.create_or_update_kbucket_locked(state, &bucket, now)?;
            return Ok(true);
        }

        let mut bucket = self.get_kbucket_id_locked(state, node.id.as_bytes())?;
        loop {
            let range = self.get_kbucket_range_locked(state, &bucket)?;
            if self.node_ids_within(state, &range)?.len() < self.bucket_size {
                self.put_node(state, &node)?;
                self.create_or_update_kbucket_locked(state, &bucket, now)?;
                state.cache.remove(&node.id);
                return Ok(true);
            }

            // Only the bucket holding the local node may split.
            let depth = partition::determine_leaf_depth(&range)?;
            if !range.contains(self.local.id.as_bytes()) || depth >= self.id_bits() {
                tracing::debug!(node = %node.id, bucket = %bucket, "bucket full, caching candidate");
                if let Some(dropped) = state.cache.push(&bucket, node) {
                    tracing::debug!(node = %dropped.id, bucket = %bucket, "replacement cache overflow");
                }
                return Ok(false);
            }

            let lower = partition::split_bucket(&bucket, depth)?;
            self.create_or_update_kbucket_locked(state, &lower, now)?;
            state.cache.split(&bucket, &lower);
            tracing::debug!(bucket = %bucket, lower = %lower, depth, "split k-bucket");

            bucket = self.get_kbucket_id_locked(state, node.id.as_bytes())?;
        }
    }

    fn update_node_locked(&self, state: &mut TableState, node: &Node) -> Result<()> {
        self.check_id(&node.id)?;
        if optional(state.nodes.get(node.id.as_bytes()))?.is_none() {
            return Err(DhtError::NodeNotFound);
        }
        self.put_node(state, node)
    }

    fn remove_node_locked(&self, state: &mut TableState, id: &NodeId) -> Result<()> {
        if id == &self.local.id {
            tracing::debug!("refusing to remove the local node");
            return Ok(());
        }
        if optional(state.nodes.get(id.as_bytes()))?.is_none() {
            return Ok(());
        }

        let bucket = self.get_kbucket_id_locked(state, id.as_bytes())?;
        state.nodes.delete(id.as_bytes())?;
        state.failures.remove(id);

        if let Some(replacement) = state.cache.pop_newest(&bucket) {
            self.put_node(state, &replacement)?;
            self.create_or_update_kbucket_locked(state, &bucket, SystemTime::now())?;
            tracing::debug!(
                removed = %id,
                promoted = %replacement.id,
                bucket = %bucket,
                "promoted replacement candidate"
            );
        }
        Ok(())
    }

    fn node_is_within_nearest_k_locked(&self, state: &TableState, id: &NodeId) -> Result<bool> {
        let ids = self.all_node_ids(state)?;
        if ids.len() < self.bucket_size {
            return Ok(true);
        }
        let Some(furthest) = self.determine_furthest_id_within_k(&ids) else {
            return Ok(true);
        };
        Ok(cmp_distance(id.as_bytes(), furthest.as_bytes(), self.local.id.as_bytes()) == Ordering::Less)
    }

    fn get_kbucket_id_locked(&self, state: &TableState, id: &[u8]) -> Result<BucketId> {
        let boundaries = self.bucket_ids(state)?;
        partition::key_to_bucket_id(id, &boundaries)
            .ok_or_else(|| RoutingError::BucketNotFound(hex::encode(id)).into())
    }

    fn get_kbucket_range_locked(&self, state: &TableState, bucket: &BucketId) -> Result<KBucketRange> {
        let boundaries = self.bucket_ids(state)?;
        let pos = boundaries
            .iter()
            .position(|b| b == bucket)
            .ok_or_else(|| RoutingError::BucketNotFound(bucket.to_hex()))?;
        let previous = pos.checked_sub(1).map(|i| boundaries[i].clone());
        Ok(KBucketRange::new(previous, bucket.clone()))
    }

    fn create_or_update_kbucket_locked(
        &self,
        state: &mut TableState,
        bucket: &BucketId,
        timestamp: SystemTime,
    ) -> Result<()> {
        state
            .kbuckets
            .put(bucket.as_bytes(), &encode_timestamp(timestamp))?;
        Ok(())
    }

    fn get_nodes_from_ids_locked(&self, state: &TableState, ids: &[NodeId]) -> Result<Vec<Node>> {
        ids.iter()
            .map(|id| {
                let value = state.nodes.get(id.as_bytes())?;
                self.decode(id, &value)
            })
            .collect()
    }

    fn node_ids_within(&self, state: &TableState, range: &KBucketRange) -> Result<Vec<NodeId>> {
        // A bucket holds at most k records, so the first page normally
        // reaches past its upper boundary.
        let page = self.bucket_size + 1;
        let mut cursor = if range.is_lowest() {
            None
        } else {
            Some(range.previous().as_bytes().to_vec())
        };
        let mut ids = Vec::new();
        loop {
            let keys = state.nodes.list(cursor.as_deref(), page)?;
            let exhausted = keys.len() < page;
            let next = keys.last().cloned();
            for key in keys {
                if cursor.as_ref() == Some(&key) {
                    continue;
                }
                if key.as_slice() > range.boundary().as_bytes() {
                    return Ok(ids);
                }
                if range.contains(&key) {
                    ids.push(NodeId::new(key));
                }
            }
            if exhausted || next.is_none() {
                return Ok(ids);
            }
            cursor = next;
        }
    }

    fn all_node_ids(&self, state: &TableState) -> Result<Vec<NodeId>> {
        Ok(state
            .nodes
            .list(None, 0)?
            .into_iter()
            .map(NodeId::new)
            .collect())
    }

    fn bucket_ids(&self, state: &TableState) -> Result<Vec<BucketId>> {
        Ok(state
            .kbuckets
            .list(None, 0)?
            .into_iter()
            .map(BucketId::new)
            .collect())
    }

    fn put_node(&self, state: &mut TableState, node: &Node) -> Result<()> {
        state
            .nodes
            .put(node.id.as_bytes(), &encode_node_record(node))?;
        Ok(())
    }

    fn decode(&self, id: &NodeId, value: &[u8]) -> Result<Node> {
        let node = decode_node_record(value)
            .map_err(|e| RoutingError::MalformedRecord(format!("node {}: {}", id, e)))?;
        if &node.id != id {
            return Err(RoutingError::MalformedRecord(format!(
                "record stored under {} names {}",
                id, node.id
            ))
            .into());
        }
        Ok(node)
    }
}
