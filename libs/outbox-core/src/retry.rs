//! Per-event retry backoff policy.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy applied to failed handler attempts.
///
/// Distinct from the polling loop's adapter-error backoff: this policy
/// schedules when an individual event becomes claimable again after its
/// handler rejected it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before an event is dead-lettered. The
    /// total attempt budget is `max_retries + 1`.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_backoff: Duration,
    /// Cap applied to the computed delay.
    pub max_backoff: Duration,
    /// Add random jitter to the delay (±30%).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay scheduled after the `retry_count`-th failure:
    /// `min(base_backoff * 2^(retry_count - 1), max_backoff)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exp = retry_count.saturating_sub(1).min(32);
        let base_ms = self.base_backoff.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff.as_millis() as u64);
        let delay = Duration::from_millis(capped_ms);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Whether an event that has already used `retries_used` retries is out
    /// of budget, i.e. its next failure is terminal.
    pub fn exhausted(&self, retries_used: u32) -> bool {
        retries_used >= self.max_retries
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = 1.0 + rng.gen_range(-0.3..0.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
