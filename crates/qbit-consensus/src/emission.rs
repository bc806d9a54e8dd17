//! Coin emission schedule.
//!
//! The subsidy halves every `HALVING_INTERVAL` blocks (an integer shift, so
//! it reaches zero after 64 halvings).

use crate::params::{HALVING_INTERVAL, INITIAL_SUBSIDY, MAX_HALVINGS};

/// Block subsidy at a given height, in sub-units.
pub fn subsidy(height: u32) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// Total subsidy emitted by blocks `0..=height`.
///
/// Closed form over whole halving periods plus the partial current period;
/// never iterates per block.
pub fn subsidy_up_to(height: u32) -> u64 {
    let mut total: u64 = 0;
    let mut period_start: u32 = 0;
    let mut halvings: u32 = 0;

    while period_start <= height && halvings < MAX_HALVINGS {
        let period_end = period_start.saturating_add(HALVING_INTERVAL - 1);
        let last = period_end.min(height);
        let blocks = (last - period_start + 1) as u64;
        total += blocks * (INITIAL_SUBSIDY >> halvings);

        if period_end >= height || period_end == u32::MAX {
            break;
        }
        period_start = period_end + 1;
        halvings += 1;
    }

    total
}

/// Upper bound on the total coins that can ever be emitted.
pub fn max_supply() -> u64 {
    // Geometric series: S * I + S/2 * I + ... < 2 * S * I.
    2 * INITIAL_SUBSIDY * HALVING_INTERVAL as u64
}
