//! Exponential backoff arithmetic.
//!
//! Pure: the random jitter sample is passed in so delays are reproducible in
//! tests. `retry` is 1-based (the first retry waits `base`).

use std::time::Duration;

/// Delay before retry number `retry`: `base * 2^(retry-1)` capped at `max`,
/// plus `jitter_fraction * base` (clamped to `[0, 1)`).
pub fn backoff_delay(base: Duration, retry: u32, max: Duration, jitter_fraction: f64) -> Duration {
    let base_ms = base.as_millis();
    let shift = retry.saturating_sub(1).min(63);
    let exp_ms = base_ms.saturating_mul(1u128 << shift);
    let capped_ms = exp_ms.min(max.as_millis());

    let fraction = if jitter_fraction.is_finite() {
        jitter_fraction.clamp(0.0, 0.999)
    } else {
        0.0
    };
    let jitter_ms = (base_ms as f64 * fraction) as u128;

    let total = capped_ms.saturating_add(jitter_ms).min(u64::MAX as u128) as u64;
    Duration::from_millis(total)
}
