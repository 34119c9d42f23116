//! Randomised scheduling delays.

use std::time::Duration;

use rand::Rng;

/// `base ± base * spread`, uniformly distributed.
///
/// `spread` is clamped to `[0, 1]`, so the result is never negative.
pub fn jittered_delay<R: Rng + ?Sized>(base: Duration, spread: f64, rng: &mut R) -> Duration {
    let spread = spread.clamp(0.0, 1.0);
    if spread == 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 + rng.gen_range(-spread..=spread);
    base.mul_f64(factor)
}
