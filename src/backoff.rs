//! Backoff delay calculation for retry policies

use rand::Rng;
use std::time::Duration;

/// Exponential backoff delay calculator
///
/// Delay for attempt `n` (1-indexed) is
/// `min(base_delay * multiplier^(n-1), max_delay)`, optionally multiplied by
/// a uniform random factor in `[0.5, 1.0]` to avoid synchronized retry
/// storms across callers.
pub struct BackoffCalculator {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl BackoffCalculator {
    /// Create a new backoff calculator
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter,
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped = self.calculate_base_delay(attempt).min(self.max_delay);
        if self.jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }

    fn calculate_base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        Duration::from_nanos((self.base_delay.as_nanos() as f64 * factor) as u64)
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.5..=1.0);
    Duration::from_nanos((delay.as_nanos() as f64 * jitter_factor) as u64)
}
