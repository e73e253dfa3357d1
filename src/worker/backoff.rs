//! Retry delay computation.
//!
//! `delay = base * 2^(attempt - 1)` with the multiplier capped at 16x,
//! jittered within +/-25% and clamped to `[1s, 10min]`. Priority picks the
//! part of the jitter band the factor is drawn from: critical tasks retry
//! early in the band, low-priority tasks late.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::RngExt;

use crate::task::Priority;

/// Lower bound of any retry delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound of any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

const MAX_EXPONENT: u32 = 4;
const JITTER: f64 = 0.25;

/// Un-jittered delay for `attempt` (1-based), before clamping.
pub fn base_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    base * (1u32 << exponent)
}

/// Jitter factors a task of this priority may draw.
fn jitter_band(priority: Priority) -> RangeInclusive<f64> {
    let (low, high) = (1.0 - JITTER, 1.0 + JITTER);
    match priority {
        Priority::Critical => low..=(low + 1.0) / 2.0,
        Priority::High => (low + 1.0) / 2.0..=1.0,
        Priority::Medium => low..=high,
        Priority::Low => 1.0..=high,
    }
}

/// Delay to wait before re-attempting a task that has failed `attempt` times.
pub fn retry_delay(base: Duration, attempt: u32, priority: Priority) -> Duration {
    let jitter = rand::rng().random_range(jitter_band(priority));
    clamp(base_delay(base, attempt).mul_f64(jitter))
}

fn clamp(delay: Duration) -> Duration {
    delay.clamp(MIN_RETRY_DELAY, MAX_RETRY_DELAY)
}
