/// Retry schedule for plugin init hooks.
///
/// A plugin whose init fails is retried up to `max_attempts` times in
/// total, sleeping between attempts. The delay starts at `initial_delay`
/// and doubles each time, capped at `max_delay`. Only after the last
/// attempt fails is the plugin marked degraded.
use std::time::Duration;

use crate::config::LifecycleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// A single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(
            config.init_attempts,
            config.initial_backoff(),
            config.max_backoff(),
        )
    }

    /// Delay to wait after the given failed attempt (1-based), or `None`
    /// once the attempts are used up.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
