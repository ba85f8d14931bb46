//! Access-frequency tracking that tunes stale times per key.
//!
//! Heavily read keys get a shorter stale time so observers see fresh data;
//! keys nobody has touched for a while get a longer one so they are not
//! revalidated needlessly. The result is always clamped to
//! `[floor, strategy.max_stale_time]`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::ConfigError;
use crate::strategy::CacheStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub enabled: bool,
    /// Reads within `hot_window` above which a key counts as hot.
    pub hot_threshold: u32,
    #[serde(with = "duration_ms", rename = "hot_window_ms")]
    pub hot_window: Duration,
    /// Idle time after which a key counts as cold.
    #[serde(with = "duration_ms", rename = "cold_after_ms")]
    pub cold_after: Duration,
    pub hot_factor: f64,
    pub cold_factor: f64,
    #[serde(with = "duration_ms", rename = "floor_ms")]
    pub floor: Duration,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: 10,
            hot_window: Duration::from_secs(60),
            cold_after: Duration::from_secs(30 * 60),
            hot_factor: 0.5,
            cold_factor: 2.0,
            floor: Duration::from_secs(5),
        }
    }
}

impl AdaptiveSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hot_factor > 0.0 && self.hot_factor <= 1.0) {
            return Err(ConfigError::InvalidSetting {
                field: "adaptive.hot_factor",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if !(self.cold_factor >= 1.0 && self.cold_factor.is_finite()) {
            return Err(ConfigError::InvalidSetting {
                field: "adaptive.cold_factor",
                reason: "must be a finite value >= 1".to_string(),
            });
        }
        if self.hot_window.is_zero() {
            return Err(ConfigError::InvalidSetting {
                field: "adaptive.hot_window_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessStat {
    pub key: String,
    pub access_count: u64,
    pub last_access: DateTime<Utc>,
    window_started: DateTime<Utc>,
    window_count: u32,
}

impl AccessStat {
    fn new(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            access_count: 0,
            last_access: now,
            window_started: now,
            window_count: 0,
        }
    }

    /// Reads counted in the current hot window.
    pub fn window_count(&self) -> u32 {
        self.window_count
    }
}

#[derive(Debug)]
pub struct AdaptiveTracker {
    settings: AdaptiveSettings,
    stats: HashMap<String, AccessStat>,
}

impl AdaptiveTracker {
    pub fn new(settings: AdaptiveSettings) -> Self {
        Self {
            settings,
            stats: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn stat(&self, key: &str) -> Option<&AccessStat> {
        self.stats.get(key)
    }

    /// Effective stale time for `key` as of `now`, computed from the reads
    /// recorded *before* this call. Call `record_access` afterwards.
    pub fn effective_stale_time(
        &self,
        key: &str,
        strategy: &CacheStrategy,
        now: DateTime<Utc>,
    ) -> Duration {
        let factor = match self.stats.get(key) {
            Some(stat) if self.is_hot(stat, now) => self.settings.hot_factor,
            Some(stat) if self.is_cold(stat, now) => self.settings.cold_factor,
            _ => 1.0,
        };

        // Saturate instead of panicking when the product overflows.
        let scaled = Duration::try_from_secs_f64(strategy.stale_time.as_secs_f64() * factor)
            .unwrap_or(strategy.max_stale_time);
        let floor = self.settings.floor.min(strategy.max_stale_time);
        scaled.clamp(floor, strategy.max_stale_time)
    }

    pub fn record_access(&mut self, key: &str, now: DateTime<Utc>) {
        let hot_window = self.settings.hot_window;
        let stat = self
            .stats
            .entry(key.to_string())
            .or_insert_with(|| AccessStat::new(key, now));

        if elapsed(stat.window_started, now) > hot_window {
            stat.window_started = now;
            stat.window_count = 0;
        }
        stat.access_count += 1;
        stat.window_count = stat.window_count.saturating_add(1);
        if now > stat.last_access {
            stat.last_access = now;
        }
    }

    /// Drop stats for keys idle longer than `max_idle`.
    pub fn prune(&mut self, now: DateTime<Utc>, max_idle: Duration) {
        self.stats
            .retain(|_, stat| elapsed(stat.last_access, now) <= max_idle);
    }

    fn is_hot(&self, stat: &AccessStat, now: DateTime<Utc>) -> bool {
        elapsed(stat.window_started, now) <= self.settings.hot_window
            && stat.window_count > self.settings.hot_threshold
    }

    fn is_cold(&self, stat: &AccessStat, now: DateTime<Utc>) -> bool {
        elapsed(stat.last_access, now) > self.settings.cold_after
    }
}

/// Non-negative time between two instants.
pub(crate) fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn strategy() -> CacheStrategy {
        CacheStrategy::new(Duration::from_secs(60), Duration::from_secs(600), &["roster"])
            .with_max_stale_time(Duration::from_secs(180))
    }

    #[test]
    fn test_unknown_key_uses_base_stale_time() {
        let tracker = AdaptiveTracker::new(AdaptiveSettings::default());
        let stale = tracker.effective_stale_time("roster", &strategy(), Utc::now());
        assert_eq!(stale, Duration::from_secs(60));
    }

    #[test]
    fn test_hot_key_gets_shorter_stale_time() {
        let mut tracker = AdaptiveTracker::new(AdaptiveSettings::default());
        let now = Utc::now();
        for _ in 0..11 {
            tracker.record_access("roster", now);
        }
        let stale = tracker.effective_stale_time("roster", &strategy(), now);
        assert_eq!(stale, Duration::from_secs(30));
    }

    #[test]
    fn test_cold_key_gets_longer_stale_time_capped_at_ceiling() {
        let settings = AdaptiveSettings {
            cold_factor: 10.0,
            ..AdaptiveSettings::default()
        };
        let mut tracker = AdaptiveTracker::new(settings);
        let then = Utc::now() - ChronoDuration::hours(2);
        tracker.record_access("roster", then);

        let stale = tracker.effective_stale_time("roster", &strategy(), Utc::now());
        assert_eq!(stale, Duration::from_secs(180));
    }

    #[test]
    fn test_huge_cold_factor_saturates() {
        let settings = AdaptiveSettings {
            cold_factor: 1e12,
            ..AdaptiveSettings::default()
        };
        assert!(settings.validate().is_ok());
        let long = Duration::from_secs(u64::MAX / 4);
        let strategy = CacheStrategy::new(long, long, &["roster"]).with_max_stale_time(long);
        let mut tracker = AdaptiveTracker::new(settings);
        tracker.record_access("roster", Utc::now() - ChronoDuration::hours(2));

        let stale = tracker.effective_stale_time("roster", &strategy, Utc::now());
        assert_eq!(stale, long);
    }

    #[test]
    fn test_never_below_floor() {
        let settings = AdaptiveSettings {
            hot_factor: 0.01,
            floor: Duration::from_secs(20),
            ..AdaptiveSettings::default()
        };
        let mut tracker = AdaptiveTracker::new(settings);
        let now = Utc::now();
        for _ in 0..50 {
            tracker.record_access("roster", now);
        }
        let stale = tracker.effective_stale_time("roster", &strategy(), now);
        assert_eq!(stale, Duration::from_secs(20));
    }

    #[test]
    fn test_window_resets() {
        let mut tracker = AdaptiveTracker::new(AdaptiveSettings::default());
        let start = Utc::now() - ChronoDuration::minutes(5);
        for _ in 0..20 {
            tracker.record_access("roster", start);
        }
        let now = Utc::now();
        tracker.record_access("roster", now);

        let stat = tracker.stat("roster").unwrap();
        assert_eq!(stat.access_count, 21);
        assert_eq!(stat.window_count(), 1);
        assert_eq!(
            tracker.effective_stale_time("roster", &strategy(), now),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_more_reads_never_lengthen_stale_time() {
        let mut tracker = AdaptiveTracker::new(AdaptiveSettings::default());
        let now = Utc::now();
        let mut previous = tracker.effective_stale_time("k", &strategy(), now);
        for _ in 0..30 {
            tracker.record_access("k", now);
            let current = tracker.effective_stale_time("k", &strategy(), now);
            assert!(current <= previous);
            previous = current;
        }
    }

    #[test]
    fn test_prune_drops_idle_keys() {
        let mut tracker = AdaptiveTracker::new(AdaptiveSettings::default());
        tracker.record_access("old", Utc::now() - ChronoDuration::hours(3));
        tracker.record_access("new", Utc::now());
        tracker.prune(Utc::now(), Duration::from_secs(3600));
        assert!(tracker.stat("old").is_none());
        assert!(tracker.stat("new").is_some());
    }

    #[test]
    fn test_settings_validation() {
        let bad = AdaptiveSettings {
            hot_factor: 1.5,
            ..AdaptiveSettings::default()
        };
        assert!(bad.validate().is_err());
        assert!(AdaptiveSettings::default().validate().is_ok());
    }
}
