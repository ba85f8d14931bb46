//! Engine configuration.
//!
//! Every field has a default, so a partial JSON file (or none at all) is a
//! valid configuration. `validate` runs whenever a configuration is loaded
//! and again when an engine is opened.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adaptive::AdaptiveSettings;
use crate::conflict::ConflictStrategy;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::router::InvalidationRouter;
use crate::strategy::StrategyTable;

/// Default byte budget for the persistent store (8 MiB).
const DEFAULT_STORE_BUDGET_BYTES: u64 = 8 * 1024 * 1024;

/// Per-attempt timeout for outbound calls.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Critical resources are refreshed in the background this often.
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

const DEFAULT_ANALYTICS_INTERVAL_SECS: u64 = 5 * 60;

/// How many replay attempts a queued mutation gets before it is given up.
const DEFAULT_MUTATION_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store_budget_bytes: u64,
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub adaptive: AdaptiveSettings,
    #[serde(with = "duration_ms", rename = "refresh_interval_ms")]
    pub refresh_interval: Duration,
    /// Key patterns the background scheduler keeps warm.
    pub critical_patterns: Vec<String>,
    #[serde(with = "duration_ms", rename = "analytics_interval_ms")]
    pub analytics_interval: Duration,
    /// Delay before a low-priority prefetch starts.
    #[serde(with = "duration_ms", rename = "low_priority_prefetch_delay_ms")]
    pub low_priority_prefetch_delay: Duration,
    pub conflict_strategy: ConflictStrategy,
    pub mutation_max_retries: u32,
    pub strategies: StrategyTable,
    pub invalidation: InvalidationRouter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_budget_bytes: DEFAULT_STORE_BUDGET_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            adaptive: AdaptiveSettings::default(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            critical_patterns: vec!["schedule".to_string(), "roster".to_string()],
            analytics_interval: Duration::from_secs(DEFAULT_ANALYTICS_INTERVAL_SECS),
            low_priority_prefetch_delay: Duration::from_millis(250),
            conflict_strategy: ConflictStrategy::default(),
            mutation_max_retries: DEFAULT_MUTATION_MAX_RETRIES,
            strategies: StrategyTable::default(),
            invalidation: InvalidationRouter::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_budget_bytes == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "store_budget_bytes",
                reason: "must be positive".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "request_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.refresh_interval.is_zero() || self.analytics_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "refresh_interval_ms",
                reason: "background intervals must be positive".to_string(),
            });
        }
        if self.critical_patterns.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidSetting {
                field: "critical_patterns",
                reason: "patterns must not be empty".to_string(),
            });
        }
        if self.mutation_max_retries == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "mutation_max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        self.retry.validate()?;
        self.adaptive.validate()?;
        self.strategies.validate()?;
        self.invalidation.validate()?;
        Ok(())
    }
}

/// Serialise `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"store_budget_bytes": 1024, "request_timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(config.store_budget_bytes, 1024);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = EngineConfig {
            store_budget_bytes: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting {
                field: "store_budget_bytes",
                ..
            })
        ));
    }

    #[test]
    fn test_empty_invalidation_rule_rejected() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"invalidation": {"rules": {"rosterChanged": []}}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
