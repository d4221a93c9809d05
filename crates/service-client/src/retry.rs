//! Exponential backoff with jitter for transient call failures.

use std::time::Duration;

use rand::Rng;

/// Retry policy applied by the client to transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Upper bound on any single delay, before jitter
    pub max_delay: Duration,
    /// Spread each delay by ±20 %
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

const JITTER_LOW: f64 = 0.8;
const JITTER_HIGH: f64 = 1.2;

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let capped = self.capped_delay(retry);
        if self.jitter {
            let factor = rand::rng().random_range(JITTER_LOW..JITTER_HIGH);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }

    fn capped_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    /// Longest a call can take when every attempt runs into `call_timeout`
    /// and every delay draws the highest jitter.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn worst_case_latency(&self, call_timeout: Duration) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let scale = |delay: Duration| {
            if !self.jitter {
                return delay;
            }
            Duration::try_from_secs_f64(delay.as_secs_f64() * JITTER_HIGH).unwrap_or(Duration::MAX)
        };

        let mut backoff = Duration::ZERO;
        let mut previous = None;
        for retry in 1..=self.max_retries {
            let delay = self.capped_delay(retry);
            if delay >= self.max_delay || previous == Some(delay) {
                // Every remaining retry waits this same delay.
                let remaining = self.max_retries - retry + 1;
                backoff = backoff.saturating_add(scale(delay).saturating_mul(remaining));
                break;
            }
            backoff = backoff.saturating_add(scale(delay));
            previous = Some(delay);
        }
        call_timeout.saturating_mul(attempts).saturating_add(backoff)
    }
}
