//! Backoff policy for rate-limited core calls
//!
//! The policy is immutable and shared; the attempt counter lives on the stack
//! of each call, so concurrent calls never draw from a common budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for HTTP 429 responses from the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0) to avoid thundering herd
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Policy with a custom retry budget and default timings
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Calculate the delay before retry number `retry` (1-based) with exponential backoff and jitter
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return self.base_delay;
        }

        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(retry as i32 - 1);

        let jitter = 1.0 + (fastrand::f64() - 0.5) * 2.0 * self.jitter_factor;
        let jittered_delay_ms = delay_ms * jitter;

        let capped_delay_ms = jittered_delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_delay_ms as u64)
    }

    /// Whether another retry is allowed after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Total attempts one call may make
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}
