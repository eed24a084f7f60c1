//! Fault coin: the per-operation decision to inject a failure.

use rand::Rng;

/// Decide whether an operation should fail, given a ratio in percent.
///
/// Draws uniformly from `0..100` and fires when the draw is strictly below
/// the ratio, so the firing rate is exactly `ratio / 100`. A ratio of 0
/// never fires and 100 or more always fires. Uses the thread-local CSPRNG,
/// so it can be called from any task without coordination.
pub fn should_fail(ratio: u8) -> bool {
    match ratio {
        0 => false,
        r if r >= 100 => true,
        r => rand::rng().random_range(0..100u8) < r,
    }
}
