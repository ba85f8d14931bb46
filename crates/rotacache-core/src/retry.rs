//! Retry budget and exponential backoff for outbound fetches.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{ConfigError, FetchError};

/// Base delay before the first retry.
const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// No backoff delay ever exceeds this.
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Total attempts for connectivity and timeout failures.
    pub connectivity_attempts: u32,
    /// Total attempts for every other retryable failure.
    pub other_attempts: u32,
    /// Upper bound of the random jitter, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            connectivity_attempts: 5,
            other_attempts: 2,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            connectivity_attempts: 1,
            other_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure on the `attempts_made`-th attempt (1-based) should
    /// be followed by another attempt.
    pub fn should_retry(&self, error: &FetchError, attempts_made: u32) -> bool {
        let budget = match error {
            FetchError::Client { .. } | FetchError::Aborted | FetchError::Conflict(_) => return false,
            e if e.is_connectivity() => self.connectivity_attempts,
            _ => self.other_attempts,
        };
        attempts_made < budget
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry` plus up
    /// to `jitter` of that, never less, capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        self.backoff_with_jitter(retry, jitter)
    }

    fn backoff_with_jitter(&self, retry: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32) * (1.0 + jitter);
        let delay_ms = self.base_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connectivity_attempts == 0 || self.other_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "retry",
                reason: "attempt counts must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidSetting {
                field: "retry.jitter",
                reason: "must be between 0 and 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_never_retried() {
        let policy = RetryPolicy::default();
        let err = FetchError::from_status(404, "");
        assert!(!policy.should_retry(&err, 1));
    }

    #[test]
    fn test_connectivity_gets_five_attempts() {
        let policy = RetryPolicy::default();
        let err = FetchError::Connectivity("refused".into());
        assert!(policy.should_retry(&err, 4));
        assert!(!policy.should_retry(&err, 5));
        assert!(policy.should_retry(&FetchError::Timeout, 4));
    }

    #[test]
    fn test_server_errors_get_two_attempts() {
        let policy = RetryPolicy::default();
        let err = FetchError::from_status(502, "");
        assert!(policy.should_retry(&err, 1));
        assert!(!policy.should_retry(&err, 2));
    }

    #[test]
    fn test_backoff_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for retry in 0..4u32 {
            let base = 1000u64 * 2u64.pow(retry);
            for _ in 0..50 {
                let delay = policy.backoff(retry).as_millis() as u64;
                assert!(delay >= base, "retry {} delay {} < {}", retry, delay, base);
                assert!(delay <= base * 11 / 10, "retry {} delay {} too large", retry, delay);
            }
        }
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_with_jitter(4, 0.1), Duration::from_millis(17_600));
        assert_eq!(policy.backoff_with_jitter(5, 0.0), Duration::from_millis(30_000));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            jitter: 2.0,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
