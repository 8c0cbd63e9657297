//! Deterministic 64-bit sort keys derived from execution provenance.
//!
//! Every work item carries an [`OrderKey`] computed from where it came from:
//! the parent node that enqueued it and the index of the edge (or fan-out
//! slot) it traveled along. Workers may finish in any order at runtime; the
//! order key restores a canonical total order at merge and enqueue time, which
//! is what makes concurrent execution reproducible.
//!
//! The key must be stable across processes, machines, and repeated runs, so it
//! is a cryptographic hash over explicitly encoded bytes rather than anything
//! derived from in-memory layout: SHA-256 over the parent id's UTF-8 bytes
//! followed by the big-endian `u32` edge index, truncated to the first 8 bytes
//! (big-endian `u64`).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::NodeId;

/// Deterministic sort key for a work item.
///
/// Compares as a plain `u64`. Genuine SHA-256 collisions are broken upstream
/// by `(parent, edge_index)` lexicographic order; see
/// [`crate::frontier::Frontier`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OrderKey(pub u64);

impl OrderKey {
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Compute the order key for a work item from its provenance.
///
/// Pure and referentially transparent: the same `(parent, edge_index)` pair
/// yields the same key in every process on every machine.
///
/// # Examples
///
/// ```rust
/// use treadle::ordering::compute_order_key;
/// use treadle::types::NodeId;
///
/// let a = compute_order_key(&NodeId::from("start"), 0);
/// let b = compute_order_key(&NodeId::from("start"), 0);
/// assert_eq!(a, b);
///
/// let c = compute_order_key(&NodeId::from("start"), 1);
/// assert_ne!(a, c);
/// ```
#[must_use]
pub fn compute_order_key(parent: &NodeId, edge_index: u32) -> OrderKey {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_str().as_bytes());
    hasher.update(edge_index.to_be_bytes());
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    OrderKey(u64::from_be_bytes(first))
}

/// Order key of a run's seed work item: parent `"<root>"`, edge index 0.
#[must_use]
pub fn seed_order_key() -> OrderKey {
    compute_order_key(&NodeId::root(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_a_function_of_both_inputs() {
        let base = compute_order_key(&NodeId::from("n"), 0);
        assert_ne!(base, compute_order_key(&NodeId::from("n"), 1));
        assert_ne!(base, compute_order_key(&NodeId::from("m"), 0));
    }

    #[test]
    fn seed_key_uses_root_sentinel() {
        assert_eq!(seed_order_key(), compute_order_key(&NodeId::root(), 0));
    }

    #[test]
    fn display_is_padded_hex() {
        let key = OrderKey(0xab);
        assert_eq!(key.to_string(), "00000000000000ab");
    }
}
