//! `NodeId`: a normalized, fixed-width identity derived from a node's
//! long-term public key, and the XOR metric Kademlia routes by.
//!
//! Adapted from a larger identity crate's `NodeId` type (which additionally
//! bound identities to a network genesis hash and a random creation nonce
//! for anti-rainbow-table hardening). Those bindings are dropped here:
//! spec.md derives `NodeId` directly from the public key with no extra
//! entropy source, so carrying genesis/nonce fields forward would be dead
//! weight never read by this crate.

use mesh_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

pub const NODE_ID_LEN: usize = 32;
/// Bit-length of the NodeId space; also the number of Kademlia buckets.
pub const NUM_BITS: usize = NODE_ID_LEN * 8;

#[derive(Debug, Error)]
pub enum NodeIdError {
    #[error("invalid hex digest length: expected {NODE_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A normalized, fixed-width node identity. Equality and ordering operate
/// on the normalized byte form; two IDs are equal iff their normalized
/// forms are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Derive a NodeId from a node's long-term public key.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        let hash = mesh_crypto::content_hash(pk.as_bytes());
        NodeId(hash.0)
    }

    /// Parse a hex digest, normalizing whitespace and case before decoding.
    pub fn from_hex(input: &str) -> Result<Self, NodeIdError> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let bytes = hex::decode(&normalized)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(NodeIdError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(NodeId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another NodeId, as a big-endian byte string
    /// interpreted as a nonnegative integer. Comparing two `XorDistance`
    /// values lexicographically is equivalent to comparing them numerically
    /// because both are big-endian fixed-width.
    pub fn xor_distance(&self, other: &NodeId) -> XorDistance {
        let mut out = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        XorDistance(out)
    }

    /// Index of the Kademlia bucket `other` falls into relative to `self`:
    /// the position (0 = least significant bit) of the highest set bit in
    /// the XOR distance, computed exactly over the full 256-bit value (no
    /// floating point, unlike a `floor(log2(distance))` shortcut that loses
    /// precision past 2^53). Returns `None` when the two ids are identical.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.xor_distance(other);
        distance.highest_set_bit()
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A big-endian 256-bit XOR distance between two NodeIds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct XorDistance([u8; NODE_ID_LEN]);

impl XorDistance {
    /// Position (0-indexed from the least significant bit) of the highest
    /// set bit, i.e. the exact bit-length of the distance minus one.
    /// `None` if the distance is zero.
    pub fn highest_set_bit(&self) -> Option<usize> {
        for (byte_index, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                let msb_index = byte_index * 8 + bit_in_byte;
                return Some(NUM_BITS - 1 - msb_index);
            }
        }
        None
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_normalizes_case_and_whitespace() {
        let id = NodeId::from_bytes([0xabu8; NODE_ID_LEN]);
        let hex = id.to_hex();
        let noisy = format!("  {}  ", hex.to_uppercase());
        assert_eq!(NodeId::from_hex(&noisy).unwrap(), id);
    }

    #[test]
    fn invalid_length_rejected() {
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn xor_distance_zero_for_identical_ids() {
        let id = NodeId::from_bytes([0x42u8; NODE_ID_LEN]);
        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn bucket_index_picks_highest_differing_bit() {
        let mut a = [0u8; NODE_ID_LEN];
        let mut b = [0u8; NODE_ID_LEN];
        a[0] = 0b1000_0000;
        b[0] = 0b0000_0000;
        let id_a = NodeId::from_bytes(a);
        let id_b = NodeId::from_bytes(b);
        // Highest bit of the first byte is bit 255 of the 256-bit space.
        assert_eq!(id_a.bucket_index(&id_b), Some(NUM_BITS - 1));
    }

    #[test]
    fn distance_ordering_matches_numeric_ordering() {
        let target = NodeId::from_bytes([0u8; NODE_ID_LEN]);
        let near = NodeId::from_bytes({
            let mut b = [0u8; NODE_ID_LEN];
            b[31] = 1;
            b
        });
        let far = NodeId::from_bytes({
            let mut b = [0u8; NODE_ID_LEN];
            b[0] = 1;
            b
        });
        assert!(target.xor_distance(&near) < target.xor_distance(&far));
    }
}
