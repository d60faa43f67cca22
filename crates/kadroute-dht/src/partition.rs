//! Identifier-space partitioning
//!
//! A bucket is identified by the inclusive upper bound of its range. The
//! stored bucket IDs always cover the whole space from zero to the all-ones
//! identifier, without gaps or overlaps. Every bucket range is an aligned
//! subtree of the ID space: its boundary is a fixed prefix followed by one
//! bits, and the length of that prefix is the bucket's leaf depth.

use crate::distance::xor;
use crate::{Result, RoutingError};
use bitvec::prelude::*;
use kadroute_core::{generate_random_node_id, NodeId};
use std::fmt;

/// Upper bound (inclusive) of a k-bucket's range
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(Vec<u8>);

impl BucketId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The all-ones boundary of the root bucket
    pub fn first(id_length: usize) -> Self {
        Self(vec![0xff; id_length])
    }

    /// The all-zero origin of the ID space
    pub fn zero(id_length: usize) -> Self {
        Self(vec![0; id_length])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn is_first(&self) -> bool {
        self.0.iter().all(|b| *b == 0xff)
    }

    /// Number of bits in the boundary
    pub fn bits(&self) -> usize {
        self.0.len() * 8
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({})", self.to_hex())
    }
}

impl From<&NodeId> for BucketId {
    fn from(id: &NodeId) -> Self {
        Self(id.as_bytes().to_vec())
    }
}

impl AsRef<[u8]> for BucketId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The half-open range `(previous, boundary]` covered by one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KBucketRange {
    /// `None` for the lowest bucket, whose range starts at zero inclusive
    previous: Option<BucketId>,
    boundary: BucketId,
}

impl KBucketRange {
    pub fn new(previous: Option<BucketId>, boundary: BucketId) -> Self {
        Self { previous, boundary }
    }

    /// The previous boundary, or the zero identifier for the lowest bucket
    pub fn previous(&self) -> BucketId {
        match &self.previous {
            Some(previous) => previous.clone(),
            None => BucketId::zero(self.boundary.0.len()),
        }
    }

    pub fn boundary(&self) -> &BucketId {
        &self.boundary
    }

    pub fn is_lowest(&self) -> bool {
        self.previous.is_none()
    }

    /// `[previous, boundary]`
    pub fn endpoints(&self) -> [BucketId; 2] {
        [self.previous(), self.boundary.clone()]
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        let above = match &self.previous {
            Some(previous) => id > previous.as_bytes(),
            None => true,
        };
        above && id <= self.boundary.as_bytes()
    }
}

/// Map an identifier onto the stored bucket whose range contains it
///
/// `boundaries` must be sorted ascending. Returns the smallest boundary
/// `>= id`, falling back to the largest one.
pub fn key_to_bucket_id(id: &[u8], boundaries: &[BucketId]) -> Option<BucketId> {
    boundaries
        .iter()
        .find(|b| id <= b.as_bytes())
        .or_else(|| boundaries.last())
        .cloned()
}

/// Index (0 = most significant) of the bit at which two boundaries split
///
/// Returns `Err(IdenticalBucketIds)` for equal arguments. When one argument
/// is the zero origin it is replaced by the all-ones identifier, and
/// comparing the all-ones boundary against the origin yields `Ok(None)`:
/// no split separates them.
pub fn determine_differing_bit_index(a: &BucketId, b: &BucketId) -> Result<Option<usize>> {
    if a == b {
        return Err(RoutingError::IdenticalBucketIds.into());
    }

    let first = BucketId::first(a.0.len());
    let (x, y) = if b.is_zero() {
        (a, &first)
    } else if a.is_zero() {
        (b, &first)
    } else {
        (a, b)
    };

    let diff = xor(x.as_bytes(), y.as_bytes())?;
    Ok(lowest_set_bit(&diff))
}

/// Msb0 index of the least significant set bit, `None` for all zeros
fn lowest_set_bit(bytes: &[u8]) -> Option<usize> {
    bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i * 8 + 7 - bytes[i].trailing_zeros() as usize)
}

/// Number of leading bits fixed by the splits that produced this range
pub fn determine_leaf_depth(range: &KBucketRange) -> Result<usize> {
    if range.is_lowest() && range.boundary.is_zero() {
        return Ok(range.boundary.bits());
    }
    Ok(
        match determine_differing_bit_index(&range.boundary, &range.previous())? {
            None => 0,
            Some(index) => index + 1,
        },
    )
}

/// Boundary of the lower half produced by splitting `bucket` at bit `depth`
///
/// Clears the bit at `depth` and sets every lower bit; the original
/// boundary stays the upper half's boundary.
pub fn split_bucket(bucket: &BucketId, depth: usize) -> Result<BucketId> {
    if depth >= bucket.bits() {
        return Err(RoutingError::SplitDepth {
            depth,
            bits: bucket.bits(),
        }
        .into());
    }

    let mut bytes = bucket.0.clone();
    let bits = bytes.view_bits_mut::<Msb0>();
    bits.set(depth, false);
    bits[depth + 1..].fill(true);
    Ok(BucketId(bytes))
}

/// A random identifier inside `range`
pub fn random_id_in_bucket(range: &KBucketRange) -> Result<NodeId> {
    let depth = determine_leaf_depth(range)?;
    let mut bytes = generate_random_node_id(range.boundary.0.len())?.into_bytes();
    let prefix = &range.boundary.as_bytes().view_bits::<Msb0>()[..depth];
    bytes.view_bits_mut::<Msb0>()[..depth].copy_from_bitslice(prefix);
    Ok(NodeId::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DhtError;

    fn bid(bytes: &[u8]) -> BucketId {
        BucketId::new(bytes.to_vec())
    }

    #[test]
    fn test_first_and_zero() {
        assert_eq!(BucketId::first(2), bid(&[255, 255]));
        assert_eq!(BucketId::zero(2), bid(&[0, 0]));
        assert!(bid(&[0, 0]).is_zero());
        assert!(bid(&[255, 255]).is_first());
    }

    #[test]
    fn test_key_to_bucket_id() {
        let boundaries = vec![bid(&[63, 255]), bid(&[79, 255]), bid(&[255, 255])];
        assert_eq!(key_to_bucket_id(&[79, 79], &boundaries), Some(bid(&[79, 255])));
        assert_eq!(key_to_bucket_id(&[0, 0], &boundaries), Some(bid(&[63, 255])));
        assert_eq!(key_to_bucket_id(&[63, 255], &boundaries), Some(bid(&[63, 255])));
        assert_eq!(key_to_bucket_id(&[64, 0], &boundaries), Some(bid(&[79, 255])));
        assert_eq!(key_to_bucket_id(&[200, 1], &boundaries), Some(bid(&[255, 255])));
        assert_eq!(key_to_bucket_id(&[1, 1], &[]), None);
    }

    #[test]
    fn test_determine_differing_bit_index() {
        let cases: &[(&[u8], &[u8], Option<usize>)] = &[
            (&[191, 255], &[255, 255], Some(1)),
            (&[255, 255], &[191, 255], Some(1)),
            (&[95, 255], &[127, 255], Some(2)),
            (&[95, 255], &[79, 255], Some(3)),
            (&[95, 255], &[63, 255], Some(2)),
            (&[255, 255], &[0, 0], None),
            (&[127, 255], &[0, 0], Some(0)),
            (&[63, 255], &[0, 0], Some(1)),
            (&[31, 255], &[0, 0], Some(2)),
            (&[0, 0], &[63, 255], Some(1)),
        ];
        for (a, b, expected) in cases {
            let diff = determine_differing_bit_index(&bid(a), &bid(b)).unwrap();
            assert_eq!(diff, *expected, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_differing_bit_index_identical_ids() {
        let err = determine_differing_bit_index(&bid(&[255, 255]), &bid(&[255, 255])).unwrap_err();
        assert!(matches!(
            err,
            DhtError::Routing(RoutingError::IdenticalBucketIds)
        ));
    }

    #[test]
    fn test_differing_bit_index_spans_bytes() {
        // (127.255, 128.127] fixes the first nine bits
        let diff = determine_differing_bit_index(&bid(&[128, 127]), &bid(&[127, 255])).unwrap();
        assert_eq!(diff, Some(8));
    }

    #[test]
    fn test_root_leaf_depth_for_every_id_length() {
        for len in [1usize, 2, 4, 8, 20, 32] {
            let root = KBucketRange::new(None, BucketId::first(len));
            assert_eq!(determine_leaf_depth(&root).unwrap(), 0, "id length {}", len);
            assert_eq!(
                determine_differing_bit_index(&BucketId::first(len), &BucketId::zero(len)).unwrap(),
                None
            );
        }
    }

    #[test]
    fn test_lowest_set_bit() {
        assert_eq!(lowest_set_bit(&[0, 0, 0]), None);
        assert_eq!(lowest_set_bit(&[]), None);
        assert_eq!(lowest_set_bit(&[0x80, 0]), Some(0));
        assert_eq!(lowest_set_bit(&[0x40, 0x01]), Some(15));
        assert_eq!(lowest_set_bit(&[0xff, 0x10]), Some(11));
    }

    #[test]
    fn test_split_bucket() {
        let cases: &[(&[u8], usize, &[u8])] = &[
            (&[255, 255], 1, &[191, 255]),
            (&[191, 255], 2, &[159, 255]),
            (&[127, 255], 1, &[63, 255]),
            (&[0, 255], 8, &[0, 127]),
            (&[95, 255], 4, &[87, 255]),
            (&[95, 255], 3, &[79, 255]),
            (&[255, 255], 0, &[127, 255]),
        ];
        for (bucket, depth, expected) in cases {
            assert_eq!(split_bucket(&bid(bucket), *depth).unwrap(), bid(expected));
        }
        assert!(split_bucket(&bid(&[255, 255]), 16).is_err());
    }

    #[test]
    fn test_determine_leaf_depth() {
        let root = KBucketRange::new(None, bid(&[255, 255]));
        assert_eq!(determine_leaf_depth(&root).unwrap(), 0);

        let lower = KBucketRange::new(None, bid(&[127, 255]));
        assert_eq!(determine_leaf_depth(&lower).unwrap(), 1);

        let upper = KBucketRange::new(Some(bid(&[127, 255])), bid(&[255, 255]));
        assert_eq!(determine_leaf_depth(&upper).unwrap(), 1);

        let mid = KBucketRange::new(Some(bid(&[63, 255])), bid(&[127, 255]));
        assert_eq!(determine_leaf_depth(&mid).unwrap(), 2);

        let low = KBucketRange::new(None, bid(&[63, 255]));
        assert_eq!(determine_leaf_depth(&low).unwrap(), 2);

        let narrow = KBucketRange::new(Some(bid(&[79, 255])), bid(&[95, 255]));
        assert_eq!(determine_leaf_depth(&narrow).unwrap(), 4);
    }

    #[test]
    fn test_range_contains() {
        let lowest = KBucketRange::new(None, bid(&[63, 255]));
        assert!(lowest.contains(&[0, 0]));
        assert!(lowest.contains(&[63, 255]));
        assert!(!lowest.contains(&[64, 0]));
        assert_eq!(lowest.endpoints(), [bid(&[0, 0]), bid(&[63, 255])]);

        let range = KBucketRange::new(Some(bid(&[63, 255])), bid(&[79, 255]));
        assert!(!range.contains(&[63, 255]));
        assert!(range.contains(&[64, 0]));
        assert!(range.contains(&[79, 79]));
        assert!(!range.contains(&[80, 0]));
    }

    #[test]
    fn test_random_id_in_bucket() {
        let range = KBucketRange::new(Some(bid(&[79, 255])), bid(&[95, 255]));
        for _ in 0..32 {
            let id = random_id_in_bucket(&range).unwrap();
            assert!(range.contains(id.as_bytes()), "{:?}", id);
        }

        let root = KBucketRange::new(None, bid(&[255, 255]));
        assert_eq!(random_id_in_bucket(&root).unwrap().len(), 2);
    }
}
