// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry and backoff for transient failures.
//!
//! Every suspension caused by a failure in this crate (remote send, log
//! read, policy store fetch) goes through a [`RetryConfig`]. A dispatch
//! loop never gives up on an entry: it backs off and retries the same
//! position, so the presets used there retry forever.
//!
//! # Example
//!
//! ```rust
//! use replication_dispatch::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::remote_send();
//! assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
//! assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
//! ```

use std::time::Duration;

/// Exponential backoff settings.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Infinite retry for remote sends and log reads.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 9+       30s (cap), forever
    /// ```
    ///
    /// A remote cluster outage of hours is normal; the loop stays parked on
    /// the unacknowledged entry and resumes when the remote comes back.
    pub fn remote_send() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Infinite retry for policy store fetches.
    ///
    /// Slower start than [`remote_send`](Self::remote_send): the last
    /// known-good policy stays in effect meanwhile.
    pub fn policy_store() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp the exponent so huge attempt counts cannot overflow into inf/NaN.
        let exponent = (attempt - 1).min(64) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_send_config() {
        let config = RetryConfig::remote_send();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_policy_store_config() {
        let config = RetryConfig::policy_store();
        assert_eq!(config.max_attempts, usize::MAX);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30)); // capped
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_for_attempt_caps_at_max() {
        let config = RetryConfig {
            max_attempts: 100,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_for_huge_attempt_does_not_panic() {
        let config = RetryConfig::remote_send();
        assert_eq!(config.delay_for_attempt(usize::MAX), config.max_delay);
        assert_eq!(config.delay_for_attempt(10_000), config.max_delay);
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
        assert!(RetryConfig::remote_send().should_retry(1_000_000));
    }

    #[test]
    fn test_retry_config_testing_preset() {
        let config = RetryConfig::testing();
        assert_eq!(config.initial_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_millis(100));
        assert_eq!(config.attempt_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
        assert_eq!(config.attempt_timeout, Duration::from_secs(5));
    }
}
