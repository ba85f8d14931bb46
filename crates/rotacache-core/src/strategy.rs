//! Static per-domain cache strategies.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::ConfigError;
use crate::key::ResourceKey;

/// Staleness and retention settings for one resource domain.
///
/// `stale_time` decides when an entry must be revalidated, `retention_time`
/// when an unobserved entry may be dropped. They are independent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStrategy {
    #[serde(with = "duration_ms", rename = "stale_time_ms")]
    pub stale_time: Duration,
    #[serde(with = "duration_ms", rename = "retention_time_ms")]
    pub retention_time: Duration,
    /// Upper bound for the adaptive tracker's effective stale time.
    #[serde(with = "duration_ms", rename = "max_stale_time_ms")]
    pub max_stale_time: Duration,
    pub tags: BTreeSet<String>,
}

impl CacheStrategy {
    pub fn new(stale_time: Duration, retention_time: Duration, tags: &[&str]) -> Self {
        Self {
            stale_time,
            retention_time,
            max_stale_time: stale_time * 4,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_max_stale_time(mut self, max: Duration) -> Self {
        self.max_stale_time = max;
        self
    }

    fn validate(&self, domain: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidStrategy {
            domain: domain.to_string(),
            reason: reason.to_string(),
        };
        if self.stale_time > self.max_stale_time {
            return Err(invalid("stale_time exceeds max_stale_time"));
        }
        if self.tags.is_empty() {
            return Err(invalid("at least one tag is required"));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("tags must not be blank"));
        }
        Ok(())
    }
}

/// Per-call strategy selection for `QueryEngine::resolve`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StrategyOverride {
    /// Use the table entry for the key's domain, adjusted by the adaptive
    /// tracker when it is enabled.
    #[default]
    Table,
    /// Use the table entry and always apply the adaptive tracker.
    Adaptive,
    /// Use exactly this strategy.
    Static(CacheStrategy),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyTable {
    domains: BTreeMap<String, CacheStrategy>,
    fallback: CacheStrategy,
}

impl Default for StrategyTable {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "schedule".to_string(),
            CacheStrategy::new(
                Duration::from_secs(2 * 60),
                Duration::from_secs(10 * 60),
                &["schedule"],
            ),
        );
        domains.insert(
            "roster".to_string(),
            CacheStrategy::new(
                Duration::from_secs(5 * 60),
                Duration::from_secs(30 * 60),
                &["roster"],
            ),
        );
        domains.insert(
            "analytics".to_string(),
            CacheStrategy::new(
                Duration::from_secs(10 * 60),
                Duration::from_secs(60 * 60),
                &["analytics"],
            ),
        );
        domains.insert(
            "settings".to_string(),
            CacheStrategy::new(
                Duration::from_secs(30 * 60),
                Duration::from_secs(24 * 60 * 60),
                &["settings"],
            ),
        );

        Self {
            domains,
            fallback: CacheStrategy::new(
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                &["default"],
            ),
        }
    }
}

impl StrategyTable {
    pub fn new(fallback: CacheStrategy) -> Self {
        Self {
            domains: BTreeMap::new(),
            fallback,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>, strategy: CacheStrategy) -> Self {
        self.domains.insert(domain.into(), strategy);
        self
    }

    pub fn get(&self, domain: &str) -> Option<&CacheStrategy> {
        self.domains.get(domain)
    }

    /// Strategy for a concrete key, falling back when the domain is unknown.
    pub fn for_key(&self, key: &ResourceKey) -> &CacheStrategy {
        key.domain()
            .and_then(|d| self.domains.get(d))
            .unwrap_or(&self.fallback)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (domain, strategy) in &self.domains {
            if domain.trim().is_empty() {
                return Err(ConfigError::InvalidStrategy {
                    domain: domain.clone(),
                    reason: "domain name must not be blank".to_string(),
                });
            }
            strategy.validate(domain)?;
        }
        self.fallback.validate("<fallback>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_key;

    #[test]
    fn test_default_table_is_valid() {
        let table = StrategyTable::default();
        assert!(table.validate().is_ok());
        assert!(table.get("schedule").is_some());
        assert!(table.get("roster").is_some());
    }

    #[test]
    fn test_for_key_uses_domain() {
        let table = StrategyTable::default();
        let strategy = table.for_key(&resource_key!["roster", "list"]);
        assert!(strategy.tags.contains("roster"));

        let unknown = table.for_key(&resource_key!["widgets"]);
        assert!(unknown.tags.contains("default"));
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let bad = CacheStrategy::new(Duration::from_secs(60), Duration::from_secs(60), &["x"])
            .with_max_stale_time(Duration::from_secs(10));
        let table = StrategyTable::default().with_domain("x", bad);
        assert!(matches!(
            table.validate(),
            Err(ConfigError::InvalidStrategy { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_missing_tags() {
        let bad = CacheStrategy::new(Duration::from_secs(1), Duration::from_secs(1), &[]);
        let table = StrategyTable::default().with_domain("x", bad);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_strategy_json_uses_milliseconds() {
        let s = CacheStrategy::new(Duration::from_secs(2), Duration::from_secs(3), &["a"]);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["stale_time_ms"], 2000);
        assert_eq!(json["retention_time_ms"], 3000);
        assert_eq!(json["max_stale_time_ms"], 8000);
    }
}
