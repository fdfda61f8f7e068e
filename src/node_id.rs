//! 160-bit NodeId arithmetic.
//!
//! A `NodeId` is a fixed 20-byte sequence interpreted as a big-endian
//! unsigned integer. XOR distance and bucket-range arithmetic are both
//! expressed as manual fixed-width operations over `[u8; 20]` rather
//! than pulling in a big-integer crate: the id space is a compile-time
//! constant 160 bits, and a hand-rolled add/shift is a handful of
//! lines versus the weight of a generic bignum dependency.
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::fmt;

pub const ID_LEN: usize = 20;

/// A 160-bit DHT node identifier.
///
/// Ordering and equality are derived field-wise over the byte array,
/// which is exactly big-endian unsigned integer comparison since both
/// operands always have the same fixed length.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Builds a `NodeId` from a byte slice, failing if it is not
    /// exactly 20 bytes long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != ID_LEN {
            return None;
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(slice);
        Some(NodeId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Generates a fresh random NodeId: 160 random bytes hashed with
    /// SHA-1 down to the 20-byte id ("uniform
    /// random, e.g. SHA-1 over randomness").
    pub fn generate() -> Self {
        let mut randomness = [0u8; 160];
        rand::rng().fill_bytes(&mut randomness);
        let digest = Sha1::digest(randomness);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest);
        NodeId(bytes)
    }

    /// XOR distance to `other`, itself representable as a `NodeId` so
    /// two distances can be compared with plain `Ord`.
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The exclusive upper bound of a bucket range.
///
/// The whole id space is `[0, 2^160)`; `2^160` itself does not fit in
/// a 20-byte array, so the single bucket that currently extends to
/// the top of the space (always the last bucket in the routing
/// table's ordered sequence) carries `Unbounded` instead of a finite
/// byte value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpperBound {
    Finite(NodeId),
    Unbounded,
}

impl UpperBound {
    pub fn contains(&self, id: &NodeId) -> bool {
        match self {
            UpperBound::Finite(max) => id < max,
            UpperBound::Unbounded => true,
        }
    }
}

/// Computes `floor((min + max) / 2)` for a half-open range `[min,
/// max)`, treating `max` as `2^160` when `Unbounded`.
pub fn midpoint(min: &NodeId, max: &UpperBound) -> NodeId {
    let (sum, carry) = match max {
        UpperBound::Finite(max) => add_with_carry(&min.0, &max.0),
        // min + 2^160: the top bit beyond byte 0 is set, the 20 visible
        // bytes are just `min` again.
        UpperBound::Unbounded => (min.0, true),
    };
    NodeId(shr1(&sum, carry))
}

fn add_with_carry(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> ([u8; ID_LEN], bool) {
    let mut result = [0u8; ID_LEN];
    let mut carry: u16 = 0;
    for i in (0..ID_LEN).rev() {
        let sum = a[i] as u16 + b[i] as u16 + carry;
        result[i] = (sum & 0xff) as u8;
        carry = sum >> 8;
    }
    (result, carry != 0)
}

/// Right-shifts a 160-bit value by one bit, treating `carry_in` as an
/// extra bit above the most significant byte (bit 160).
fn shr1(bytes: &[u8; ID_LEN], carry_in: bool) -> [u8; ID_LEN] {
    let mut result = [0u8; ID_LEN];
    let mut carry: u8 = carry_in as u8;
    for i in 0..ID_LEN {
        let b = bytes[i];
        result[i] = (b >> 1) | (carry << 7);
        carry = b & 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_distinct_ids() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = NodeId::generate();
        assert_eq!(a.distance(&a), NodeId::ZERO);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn midpoint_of_full_space_is_half() {
        let mid = midpoint(&NodeId::ZERO, &UpperBound::Unbounded);
        let mut expected = [0u8; ID_LEN];
        expected[0] = 0x80;
        assert_eq!(mid, NodeId::from_bytes(expected));
    }

    #[test]
    fn midpoint_splits_finite_range_evenly() {
        let min = NodeId::ZERO;
        let mut max_bytes = [0u8; ID_LEN];
        max_bytes[ID_LEN - 1] = 0x10; // max = 16
        let max = UpperBound::Finite(NodeId::from_bytes(max_bytes));
        let mid = midpoint(&min, &max);
        let mut expected = [0u8; ID_LEN];
        expected[ID_LEN - 1] = 0x08; // mid = 8
        assert_eq!(mid, NodeId::from_bytes(expected));
    }

    #[test]
    fn ordering_is_big_endian_unsigned() {
        let mut small = [0u8; ID_LEN];
        small[ID_LEN - 1] = 1;
        let mut large = [0u8; ID_LEN];
        large[0] = 1;
        assert!(NodeId::from_bytes(small) < NodeId::from_bytes(large));
    }
}
