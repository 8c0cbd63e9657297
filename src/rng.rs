//! Deterministic randomness for node execution and retry jitter.
//!
//! All randomness the engine hands to user code flows through [`DetRng`], a
//! ChaCha20 stream seeded from `(run seed, run id, order key)`. Two runs with
//! the same seed and the same work item provenance draw identical values, on
//! any machine, which is what keeps jittered retries and randomized nodes
//! replayable. Global RNGs and clocks inside nodes are determinism violations
//! the engine cannot prevent; it can only make the sanctioned path easy.
//!
//! The `u64 → 32-byte` seed mapping is explicit (SHA-256 of the encoded
//! inputs) so there is no endianness or algorithm ambiguity across platforms.
//! Integer ranges use rejection sampling rather than float math.

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::ordering::OrderKey;
use crate::types::RunId;

/// Domain separator so engine RNG seeds cannot collide with other digests.
const SEED_DOMAIN: &[u8] = b"treadle.rng.v1";

/// Deterministic per-work-item random stream.
///
/// One `DetRng` is created per dispatched work item and shared by every
/// attempt of that item: retry jitter consumes successive draws from the same
/// stream, so the sequence of backoff delays is itself deterministic.
#[derive(Debug, Clone)]
pub struct DetRng {
    rng: ChaCha20Rng,
    draws: u64,
}

impl DetRng {
    /// Derive the stream for one work item.
    #[must_use]
    pub fn for_work_item(run_seed: i64, run_id: &RunId, order_key: OrderKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(run_seed.to_be_bytes());
        hasher.update(run_id.as_str().as_bytes());
        hasher.update(order_key.as_u64().to_be_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);
        Self {
            rng: ChaCha20Rng::from_seed(seed),
            draws: 0,
        }
    }

    /// Number of 64-bit words drawn so far (accepted and rejected alike).
    #[must_use]
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Draw the next raw 64-bit word.
    pub fn next_u64(&mut self) -> u64 {
        self.draws = self.draws.saturating_add(1);
        self.rng.next_u64()
    }

    /// Unbiased integer in `[0, n)` via rejection sampling; `n == 0` yields 0.
    ///
    /// Accepts a word `x` when `x >= 2^64 mod n`, after which `x % n` is
    /// uniform. The expected number of rejected draws is below one.
    pub fn next_range(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        let threshold = n.wrapping_neg() % n;
        loop {
            let x = self.next_u64();
            if x >= threshold {
                return x % n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::compute_order_key;
    use crate::types::NodeId;

    fn rng() -> DetRng {
        DetRng::for_work_item(
            7,
            &RunId::from("run-1"),
            compute_order_key(&NodeId::from("a"), 0),
        )
    }

    #[test]
    fn identical_inputs_yield_identical_streams() {
        let mut a = rng();
        let mut b = rng();
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_order_keys_diverge() {
        let run = RunId::from("run-1");
        let mut a = DetRng::for_work_item(7, &run, compute_order_key(&NodeId::from("a"), 0));
        let mut b = DetRng::for_work_item(7, &run, compute_order_key(&NodeId::from("a"), 1));
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn range_draws_are_in_bounds() {
        let mut r = rng();
        for _ in 0..1000 {
            assert!(r.next_range(10) < 10);
        }
        assert_eq!(r.next_range(0), 0);
        assert_eq!(r.next_range(1), 0);
    }
}
