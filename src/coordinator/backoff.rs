//! Bounded exponential backoff for ledger submissions

use std::time::Duration;

/// Doubling delay with a cap and a bounded attempt count. Transient
/// submission failures are retried through this; protocol violations are
/// never retried.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_config(config: &crate::config::CoordinatorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.max_retries,
        )
    }

    /// Delay before the next retry, or None once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .checked_mul(1u32 << self.attempt.min(16))
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap);
        self.attempt += 1;
        Some(delay)
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt
    }
}
