//! The simulator's single deterministic randomness source.
//!
//! Every mutation draw and every allocator tie-break (today: none) passes through one
//! `Rng` instance. Progress reporting and logging must never call into it — doing so
//! would make two runs with the same seed diverge.

use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};

/// Deterministic, serializable randomness.
///
/// Wraps `ChaCha8Rng` rather than a thread-local generator: the whole point is that
/// `save_state`/`restore` round-trip the exact internal state, not just the seed, so a
/// restored run reproduces the same draw sequence a continuous run would have made.
#[derive(Debug)]
pub struct Rng {
    initial_seed: i64,
    inner: ChaCha8Rng,
}

impl Rng {
    pub fn new(initial_seed: i64) -> Self {
        Self { initial_seed, inner: ChaCha8Rng::seed_from_u64(initial_seed as u64) }
    }

    pub fn initial_seed(&self) -> i64 {
        self.initial_seed
    }

    pub fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    /// Uniform float in `[0, 1)`, built from 53 bits of entropy.
    pub fn next_f64_unit(&mut self) -> f64 {
        let bits = self.inner.next_u64() >> 11;
        (bits as f64) * (1.0 / (1u64 << 53) as f64)
    }

    /// Uniform integer in `[0, n)`. `n == 0` always yields `0`.
    pub fn next_bounded(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        // Lemire's method: zero wrap-around bias without a rejection loop in the
        // common case, at the cost of a 64-bit multiply.
        let mut m = (self.next_u32() as u64) * (n as u64);
        let mut low = m as u32;
        if low < n {
            let threshold = n.wrapping_neg() % n;
            while low < threshold {
                m = (self.next_u32() as u64) * (n as u64);
                low = m as u32;
            }
        }
        (m >> 32) as u32
    }

    /// Serialize the generator's internal state (not the seed alone) plus the seed.
    pub fn save_state(&self) -> Vec<u8> {
        let record = SerializedRng { initial_seed: self.initial_seed, inner: self.inner.clone() };
        serde_json::to_vec(&record).expect("ChaCha8Rng state is always serializable")
    }

    /// Inverse of `save_state`. Fails only if `bytes` wasn't produced by `save_state`.
    pub fn restore(bytes: &[u8]) -> Result<Self, RestoreError> {
        let record: SerializedRng = serde_json::from_slice(bytes)?;
        Ok(Self { initial_seed: record.initial_seed, inner: record.inner })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SerializedRng {
    initial_seed: i64,
    inner: ChaCha8Rng,
}

#[derive(Debug, thiserror::Error)]
#[error("corrupt rng state: {0}")]
pub struct RestoreError(#[from] serde_json::Error);
