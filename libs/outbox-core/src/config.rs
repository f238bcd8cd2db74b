//! Common adapter and polling options.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Options shared by storage adapters and the polling service.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    /// Maximum events claimed per tick.
    pub batch_size: usize,
    /// Nominal period between polling ticks.
    pub poll_interval: Duration,
    /// Per-event retry budget.
    pub max_retries: u32,
    /// Base of the per-event exponential backoff.
    pub base_backoff: Duration,
    /// Visibility deadline after a claim; past it the event counts as stuck
    /// and becomes claimable again.
    pub processing_timeout: Duration,
    /// Cap on the polling loop's adapter-error backoff.
    pub max_error_backoff: Duration,
    /// Add random jitter to per-event retry delays.
    pub jitter: bool,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(1000),
            max_retries: 5,
            base_backoff: Duration::from_millis(1000),
            processing_timeout: Duration::from_secs(30),
            max_error_backoff: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl OutboxOptions {
    /// The per-event retry policy implied by these options.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
            max_backoff: Duration::from_secs(30),
            jitter: self.jitter,
        }
    }
}
