//! Capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff capped at `max_delay`.
///
/// `delay_for_attempt(n) = min(base_delay * multiplier^(n-1), max_delay)` for
/// `n >= 1`. The sequence is non-decreasing as long as `multiplier >= 1.0`, which
/// [`Backoff::new`] enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            base_delay: base_delay.min(max_delay),
            multiplier,
            max_delay,
        }
    }

    /// Delay to wait before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let max_ms = self.max_delay.as_millis() as f64;
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * exp).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Same as [`Self::delay_for_attempt`], as a `chrono` duration for timestamp math.
    pub fn chrono_delay_for_attempt(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max_delay.as_millis() as i64))
    }
}
