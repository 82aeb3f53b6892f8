//! Explicit retry policy for transient send failures: bounded attempts,
//! exponential backoff, decoupled from the poll loop itself.

use chrono::Duration;

use cadence_core::config::RetryConfig;

pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.config.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), exponentially grown
    /// and capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let minutes = self.config.base_delay_minutes as f64
            * self.config.backoff_multiplier.powi(exponent as i32);
        let capped = minutes.min(self.config.max_delay_minutes as f64);
        Duration::minutes(capped.round() as i64)
    }
}
