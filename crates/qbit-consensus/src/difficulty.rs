//! Per-block difficulty retargeting.
//!
//! The next target is derived every block from the solve times of the last
//! 60 blocks. The observed span is pulled a quarter of the way toward the
//! expected span and clamped to a factor of four in either direction, so a
//! sudden hashrate change moves difficulty smoothly instead of all at once.

use crate::{ChainParams, params};
use num_bigint::BigUint;
use qbit_core::{compact_to_target, target_to_compact};
use tracing::debug;

/// Header fields needed by the retarget.
#[derive(Debug, Clone, Copy)]
pub struct HeaderTiming {
    pub height: u32,
    pub time: u32,
    pub target_bits: u32,
}

/// Difficulty retarget calculator.
pub struct DifficultyEngine {
    /// Target solve time per block, in seconds.
    target_block_time: u32,
    /// Averaging window in blocks.
    window: u32,
    /// Damping factor: maximum adjustment per step.
    damping: u32,
    /// Easiest permitted target.
    max_target: BigUint,
    max_target_bits: u32,
}

impl DifficultyEngine {
    pub fn new(params: &ChainParams) -> Self {
        Self::with_params(
            params.target_block_time,
            params.retarget_window,
            params::RETARGET_DAMPING,
            params.max_target_bits,
        )
    }

    /// Custom parameters, for tests.
    pub fn with_params(
        target_block_time: u32,
        window: u32,
        damping: u32,
        max_target_bits: u32,
    ) -> Self {
        let max_target =
            compact_to_target(max_target_bits).expect("max target bits must be canonical");
        Self {
            target_block_time,
            window,
            damping,
            max_target,
            max_target_bits,
        }
    }

    /// Compute the compact target required for the child of the last header
    /// in `ancestors`.
    ///
    /// `ancestors` is a chronological run of headers ending at the parent,
    /// at most `window + 1` long. For the first blocks after genesis the run
    /// is shorter and the retarget uses whatever exists; with fewer than two
    /// headers the parent's target carries over unchanged.
    pub fn next_target(&self, ancestors: &[HeaderTiming]) -> u32 {
        let parent = match ancestors.last() {
            Some(parent) => parent,
            None => return self.max_target_bits,
        };
        if ancestors.len() < 2 {
            return parent.target_bits;
        }

        let first = &ancestors[0];
        let intervals = (ancestors.len() - 1) as i128;
        let expected = self.target_block_time as i128 * intervals;

        // Solve times can run backwards within the median-time tolerance;
        // a non-positive span is treated as one second.
        let span = (parent.time as i128 - first.time as i128).max(1);

        // Damped adjustment: pull the observed span a quarter of the way
        // toward the expected span, then clamp to the damping bounds.
        let adjusted = span + span * (expected - span) / (self.damping as i128 * expected);
        let adjusted = adjusted.clamp(
            expected / self.damping as i128,
            expected * self.damping as i128,
        );

        let parent_target = match compact_to_target(parent.target_bits) {
            Some(t) => t,
            None => return self.max_target_bits,
        };

        let mut next = parent_target * BigUint::from(adjusted as u64)
            / BigUint::from(expected as u64);
        if next > self.max_target {
            next = self.max_target.clone();
        }
        if next == BigUint::default() {
            next = BigUint::from(1u8);
        }

        let bits = target_to_compact(&next);
        debug!(
            height = parent.height + 1,
            span = span as i64,
            expected = expected as i64,
            bits,
            "retarget"
        );
        bits
    }
}

/// Median of the most recent block times; `times` is chronological and at
/// most [`params::MEDIAN_TIME_SPAN`] long. A new block's time must be
/// strictly greater than this.
pub fn median_time_past(times: &[u32]) -> u32 {
    if times.is_empty() {
        return 0;
    }
    let mut sorted = times.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}
