//! Exponential backoff for bridge reconnection
//!
//! Pure counter, no I/O. The delay starts at `initial`, doubles on each
//! attempt and is capped at `max_delay`. Once `max_attempts` delays have been
//! handed out, `next_delay` returns `Duration::ZERO` meaning "give up".

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of reconnection attempts before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default first delay
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry policy settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of reconnection attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Attempt counter plus current delay
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    max_attempts: u32,
    initial: Duration,
    max_delay: Duration,
    current: Duration,
}

impl RetryPolicy {
    /// Create a policy with explicit limits
    pub fn new(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            initial,
            max_delay,
            current: initial.min(max_delay),
        }
    }

    /// Create a policy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before the next attempt, or `Duration::ZERO` once exhausted
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts >= self.max_attempts {
            return Duration::ZERO;
        }

        let delay = self.current;
        self.attempts += 1;
        self.current = self.current.saturating_mul(2).min(self.max_delay);
        delay
    }

    /// Restore the initial state after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = self.initial.min(self.max_delay);
    }

    /// Whether another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Configured attempt limit
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_default_sequence() {
        let mut policy = RetryPolicy::default();
        let delays: Vec<Duration> = (0..7).map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![secs(1), secs(2), secs(4), secs(8), secs(16), Duration::ZERO, Duration::ZERO]
        );
        assert_eq!(policy.attempts(), 5);
        assert!(!policy.should_retry());
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut policy = RetryPolicy::default();
        policy.next_delay();
        policy.next_delay();
        policy.next_delay();
        policy.reset();

        assert_eq!(policy.attempts(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), secs(1));
        assert_eq!(policy.next_delay(), secs(2));
    }

    #[test]
    fn test_delay_is_capped() {
        let mut policy = RetryPolicy::new(10, secs(1), secs(30));
        let delays: Vec<u64> = (0..10).map(|_| policy.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut policy = RetryPolicy::new(0, secs(1), secs(30));
        assert!(!policy.should_retry());
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 15,
        };
        let mut policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.next_delay(), Duration::from_millis(10));
        assert_eq!(policy.next_delay(), Duration::from_millis(15));
        assert_eq!(policy.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RetryConfig::default());
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
    }
}
