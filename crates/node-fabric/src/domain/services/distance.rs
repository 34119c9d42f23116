//! Kademlia distance calculations.

use rand::Rng;

use crate::domain::{NodeGraphError, NodeId};

/// XOR distance between two node ids, read as a big-endian unsigned integer.
///
/// Ordering compares the integers, so a smaller `Distance` is nearer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(Vec<u8>);

impl Distance {
    /// Raw big-endian bytes of the distance.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the two ids were identical.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Position of the highest set bit, counted from the least significant bit.
    ///
    /// `None` for a zero distance.
    pub fn highest_bit(&self) -> Option<usize> {
        let bits = self.0.len() * 8;
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let leading = i * 8 + byte.leading_zeros() as usize;
                return Some(bits - 1 - leading);
            }
        }
        None
    }
}

/// Calculate the XOR distance between two node ids.
///
/// # Properties
/// - Symmetric: `xor_distance(a, b) == xor_distance(b, a)`
/// - Zero exactly when `a == b`
///
/// Ids of different widths are compared right-aligned, the shorter one
/// padded with leading zero bytes.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> Distance {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let len = a.len().max(b.len());
    let byte_at = |bytes: &[u8], i: usize| -> u8 {
        let pad = len - bytes.len();
        if i < pad {
            0
        } else {
            bytes[i - pad]
        }
    };
    Distance((0..len).map(|i| byte_at(a, i) ^ byte_at(b, i)).collect())
}

/// Bucket index of `other` relative to `own`.
///
/// Bucket `i` holds peers whose distance `d` satisfies `2^i <= d < 2^(i+1)`,
/// so the index is the position of the highest set bit of the distance.
pub fn bucket_index(own: &NodeId, other: &NodeId) -> Result<usize, NodeGraphError> {
    if own.bits() != other.bits() {
        return Err(NodeGraphError::InvalidNodeId {
            expected: own.bits(),
            actual: other.bits(),
        });
    }
    xor_distance(own, other)
        .highest_bit()
        .ok_or(NodeGraphError::SameNodeId)
}

/// Fixed-width, lexicographically ordered storage key of a bucket index.
pub fn bucket_key(index: usize) -> String {
    format!("{index:04x}")
}

/// Inverse of [`bucket_key`].
pub fn parse_bucket_key(key: &str) -> Option<usize> {
    usize::from_str_radix(key, 16).ok()
}

/// Random node id that falls into bucket `index` relative to `own`.
///
/// The distance gets bit `index` set, random bits below it and zero bits
/// above it, so `bucket_index(own, result) == index`.
pub fn random_node_id_in_bucket<R: Rng + ?Sized>(
    own: &NodeId,
    index: usize,
    rng: &mut R,
) -> Result<NodeId, NodeGraphError> {
    let bits = own.bits();
    if index >= bits {
        return Err(NodeGraphError::BucketIndexOutOfRange { index, bits });
    }
    let len = own.as_bytes().len();
    let mut distance = vec![0u8; len];
    rng.fill(&mut distance[..]);

    // Byte and bit of `index`, counting from the least significant end.
    let byte = len - 1 - index / 8;
    let bit = index % 8;
    for b in distance.iter_mut().take(byte) {
        *b = 0;
    }
    let keep_below = (1u16 << bit) as u8 - 1;
    distance[byte] = (distance[byte] & keep_below) | (1u8 << bit);

    let id = own
        .as_bytes()
        .iter()
        .zip(distance.iter())
        .map(|(a, d)| a ^ d)
        .collect::<Vec<u8>>();
    Ok(NodeId::new(id))
}
