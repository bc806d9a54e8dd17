//! Retarget behavior over whole windows, including the damping clamp.

use proptest::prelude::*;
use num_bigint::BigUint;
use qbit_consensus::{params, DifficultyEngine, HeaderTiming};
use qbit_core::compact_to_target;

const BITS: u32 = 0x1d00_ffff;

fn engine() -> DifficultyEngine {
    DifficultyEngine::with_params(
        params::TARGET_BLOCK_TIME,
        params::RETARGET_WINDOW,
        params::RETARGET_DAMPING,
        params::MAX_TARGET_BITS,
    )
}

fn window_with_solve_time(solve_time: u32) -> Vec<HeaderTiming> {
    (0..=params::RETARGET_WINDOW)
        .map(|i| HeaderTiming {
            height: i,
            time: 1_000_000 + i * solve_time,
            target_bits: BITS,
        })
        .collect()
}

#[test]
fn test_target_stationary_at_exact_solve_time() {
    // Invariant: constant solve time at the target keeps the target
    // sequence stationary block after block.
    let engine = engine();
    let mut window = window_with_solve_time(params::TARGET_BLOCK_TIME);
    for _ in 0..10 {
        let next = engine.next_target(&window);
        assert_eq!(next, BITS);
        let last = window.last().unwrap();
        let next_header = HeaderTiming {
            height: last.height + 1,
            time: last.time + params::TARGET_BLOCK_TIME,
            target_bits: next,
        };
        window.remove(0);
        window.push(next_header);
    }
}

#[test]
fn test_damping_at_eighth_solve_time() {
    // Blocks solved in an eighth of the target time: the retarget divides
    // the target by the damping factor (4), not by 8.
    let engine = engine();
    let window = window_with_solve_time(params::TARGET_BLOCK_TIME / 8);
    let next = compact_to_target(engine.next_target(&window)).unwrap();
    let old = compact_to_target(BITS).unwrap();
    let ratio = &old / &next;
    assert_eq!(ratio, BigUint::from(4u8), "clamped to the damping factor");
}

#[test]
fn test_first_window_uses_available_ancestors() {
    // The first 60 blocks retarget over whatever ancestors exist, without
    // underflow.
    let engine = engine();
    for count in 0..params::RETARGET_WINDOW {
        let window: Vec<HeaderTiming> = (0..count)
            .map(|i| HeaderTiming {
                height: i,
                time: 1_000_000 + i * params::TARGET_BLOCK_TIME,
                target_bits: BITS,
            })
            .collect();
        let next = engine.next_target(&window);
        assert!(
            compact_to_target(next).is_some(),
            "{count} ancestors produced a non-canonical target"
        );
    }
}

proptest! {
    #[test]
    fn prop_retarget_bounded_by_damping(solve_time in 1u32..10_000) {
        // Whatever the observed solve time, one retarget step never moves
        // the target by more than the damping factor (give or take compact
        // mantissa rounding).
        let engine = engine();
        let window = window_with_solve_time(solve_time);
        let next = compact_to_target(engine.next_target(&window)).unwrap();
        let old = compact_to_target(BITS).unwrap();
        let damping = BigUint::from(params::RETARGET_DAMPING);

        prop_assert!(&next <= &(&old * &damping), "raised past the clamp");
        prop_assert!(
            &next * &damping * BigUint::from(2u8) >= old,
            "lowered past the clamp"
        );
    }
}
