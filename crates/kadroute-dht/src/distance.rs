//! XOR metric helpers

use crate::{Result, RoutingError};
use kadroute_core::{Node, NodeId};
use std::cmp::Ordering;

/// XOR distance between two identifiers of equal length
pub fn xor(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    if a.len() != b.len() {
        return Err(RoutingError::IdLength {
            expected: a.len(),
            actual: b.len(),
        }
        .into());
    }
    Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
}

/// Compare the distances of `a` and `b` to `pivot`, most significant byte first
pub fn cmp_distance(a: &[u8], b: &[u8], pivot: &[u8]) -> Ordering {
    for ((x, y), p) in a.iter().zip(b).zip(pivot) {
        match (x ^ p).cmp(&(y ^ p)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Sort identifiers by ascending XOR distance to `pivot`
///
/// The sort is stable, so equal distances keep their input order.
pub fn sort_by_xor(ids: &mut [NodeId], pivot: &NodeId) {
    ids.sort_by(|a, b| cmp_distance(a.as_bytes(), b.as_bytes(), pivot.as_bytes()));
}

/// Sort nodes by ascending XOR distance of their IDs to `pivot`
pub fn sort_nodes_by_xor(nodes: &mut [Node], pivot: &NodeId) {
    nodes.sort_by(|a, b| cmp_distance(a.id.as_bytes(), b.id.as_bytes(), pivot.as_bytes()));
}
