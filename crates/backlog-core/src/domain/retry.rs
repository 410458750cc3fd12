//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Retry policy for failed tasks.
///
/// Pure and deterministic: the same inputs always give the same delay, so
/// schedules can be asserted exactly in tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay unit: `backoff(0) == base_delay`.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// 2s base, doubling, capped at 10 minutes.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Another attempt is allowed while `retry_count < max_retries`.
    pub fn is_retryable(&self, retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Delay before retry number `retry_count` becomes eligible.
    ///
    /// delay = base_delay * multiplier^retry_count, capped at `max_delay`.
    ///
    /// With base_delay=2s, multiplier=2.0:
    /// - retry 1: 4s
    /// - retry 2: 8s
    /// - retry 3: 16s
    pub fn backoff(&self, retry_count: u32) -> Duration {
        // exponents past 1023 are already infinite as f64
        let exponent = retry_count.min(1_023) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap_secs = self.max_delay.as_secs_f64();

        if !delay_secs.is_finite() || delay_secs >= cap_secs {
            self.max_delay
        } else {
            // a negative multiplier can flip the sign; no delay then
            Duration::from_secs_f64(delay_secs.max(0.0))
        }
    }
}
