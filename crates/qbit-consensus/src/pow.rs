//! Epoch-keyed proof-of-work.
//!
//! The PoW hash of a header is produced by a CPU-biased scratchpad kernel
//! seeded with a per-epoch key. The key for a block at height `h` is the id
//! of the block at height `h - (h mod 2048) - 64`, clamped to genesis for the
//! first blocks; it changes once per 2048-block epoch, so validators keep
//! ancestors up to ~2112 blocks back but never rebuild state per block.
//!
//! The kernel sits behind [`PowKernel`] so a heavier external memory-hard
//! kernel can be configured without touching the consensus layer.

use crate::params::{EPOCH_LAG, EPOCH_LENGTH};
use num_bigint::BigUint;
use qbit_core::{hash_tagged, hash_tagged2, tags, Hash};
use std::sync::Arc;

/// Proof-of-work hash kernel.
pub trait PowKernel: Send + Sync {
    /// Hash `header_bytes` under the given epoch key.
    fn pow_hash(&self, epoch_key: &Hash, header_bytes: &[u8]) -> Hash;
}

/// The shipped kernel: a Blake2b scratchpad construction.
///
/// A scratchpad of hash-sized lanes is filled by chaining from the seed, then
/// mixed with data-dependent reads so the whole pad stays live in memory.
/// Deterministic and allocation-bound; verification cost is a few hundred
/// hash compressions.
pub struct ScratchpadKernel {
    lanes: usize,
    passes: usize,
}

impl ScratchpadKernel {
    /// 512 lanes (16 KiB) and two mixing passes.
    pub fn new() -> Self {
        Self::with_params(512, 2)
    }

    /// Custom dimensions, for tests.
    pub fn with_params(lanes: usize, passes: usize) -> Self {
        assert!(lanes > 0 && passes > 0);
        Self { lanes, passes }
    }
}

impl Default for ScratchpadKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl PowKernel for ScratchpadKernel {
    fn pow_hash(&self, epoch_key: &Hash, header_bytes: &[u8]) -> Hash {
        let seed = hash_tagged2(tags::POW_SEED, epoch_key.as_bytes(), header_bytes);

        // Fill: lane[i] = H(seed || i || lane[i-1]).
        let mut pad: Vec<Hash> = Vec::with_capacity(self.lanes);
        let mut prev = seed;
        for i in 0..self.lanes {
            let mut input = Vec::with_capacity(40);
            input.extend_from_slice(&(i as u64).to_le_bytes());
            input.extend_from_slice(prev.as_bytes());
            prev = hash_tagged2(tags::POW_SEED, seed.as_bytes(), &input);
            pad.push(prev);
        }

        // Mix: data-dependent reads, each overwriting the lane it touched.
        let mut cursor = prev;
        for _ in 0..self.passes * self.lanes {
            let idx = u64::from_le_bytes(cursor.as_bytes()[..8].try_into().unwrap()) as usize
                % self.lanes;
            cursor = hash_tagged2(tags::POW_SEED, cursor.as_bytes(), pad[idx].as_bytes());
            pad[idx] = cursor;
        }

        hash_tagged2(tags::POW_FINAL, seed.as_bytes(), cursor.as_bytes())
    }
}

/// Proof-of-work engine: the kernel plus the epoch schedule.
#[derive(Clone)]
pub struct PowEngine {
    kernel: Arc<dyn PowKernel>,
}

impl PowEngine {
    pub fn new(kernel: Arc<dyn PowKernel>) -> Self {
        Self { kernel }
    }

    /// Height of the block whose id keys the epoch containing height `h`.
    /// Clamped to genesis while the chain is shorter than one epoch plus the
    /// lag.
    pub fn epoch_key_height(height: u32) -> u32 {
        let boundary = height - height % EPOCH_LENGTH;
        boundary.saturating_sub(EPOCH_LAG)
    }

    /// PoW hash of a header under the epoch key; this is the block id.
    pub fn block_hash(&self, epoch_key: &Hash, header_bytes: &[u8]) -> Hash {
        self.kernel.pow_hash(epoch_key, header_bytes)
    }

    /// Check a header's PoW against a decoded target.
    pub fn check(&self, epoch_key: &Hash, header_bytes: &[u8], target: &BigUint) -> bool {
        let hash = self.block_hash(epoch_key, header_bytes);
        BigUint::from_bytes_be(hash.as_bytes()) <= *target
    }
}

impl Default for PowEngine {
    fn default() -> Self {
        Self::new(Arc::new(ScratchpadKernel::new()))
    }
}
