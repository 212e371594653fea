//! Reconnect delay policies for the two links.

use std::time::Duration;

/// Local realtime link: a few fast retries, then a slow steady cadence.
/// Never gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRetryPolicy {
    pub fast_attempts: u32,
    pub fast_delay: Duration,
    pub slow_delay: Duration,
}

impl LocalRetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failed
    /// connects (`failures >= 1`).
    pub fn delay_after_failure(&self, failures: u32) -> Duration {
        if failures < self.fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }
}

impl Default for LocalRetryPolicy {
    fn default() -> Self {
        LocalRetryPolicy {
            fast_attempts: 3,
            fast_delay: Duration::from_secs(2),
            slow_delay: Duration::from_secs(30),
        }
    }
}

/// Cloud link: capped exponential backoff, unbounded attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl CloudBackoff {
    /// `min(initial * 2^(failures-1), max)`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for CloudBackoff {
    fn default() -> Self {
        CloudBackoff {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(5000),
        }
    }
}
