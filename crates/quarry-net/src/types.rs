use std::{cmp::min, time::Duration};

/// Bounded retry schedule with exponential backoff.
///
/// `max_attempts` is the total attempt budget, including the first try.
/// `delay_for_attempt(n)` is the backoff after `n` failed attempts: zero
/// before the first try, then exponential from `base_delay`, capped at
/// `max_delay`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let exponential_delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        min(exponential_delay, self.max_delay)
    }
}

#[derive(Clone, Debug)]
pub struct NetOptions {
    pub request_timeout: Duration,
    /// Max idle connections per host. Set to 0 to disable pooling and reduce memory.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 0,
        }
    }
}
