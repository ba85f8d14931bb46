//! Periodic refresh of observed critical keys.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::QueryEngine;
use crate::stopped;

/// Counts from one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    pub evicted: usize,
}

pub struct BackgroundRefresher {
    engine: QueryEngine,
    interval: Duration,
    patterns: Vec<String>,
}

impl BackgroundRefresher {
    pub fn new(engine: QueryEngine, interval: Duration, patterns: Vec<String>) -> Self {
        Self {
            engine,
            interval,
            patterns,
        }
    }

    /// Refetch every observed key matching a critical pattern, then drop
    /// expired entries. Unobserved keys are never refreshed.
    pub async fn run_once(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        for key in self.engine.observed_keys_matching(&self.patterns) {
            match self.engine.refresh(&key).await {
                Ok(_) => report.refreshed += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Background refresh failed");
                    report.failed += 1;
                }
            }
        }

        match self.engine.evict_expired().await {
            Ok(evicted) => report.evicted = evicted,
            Err(e) => warn!(error = %e, "Failed to evict expired entries"),
        }

        debug!(
            refreshed = report.refreshed,
            failed = report.failed,
            evicted = report.evicted,
            "Background refresh pass"
        );
        report
    }

    /// Run a pass every `interval` until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    _ = stopped(&mut shutdown) => break,
                }
            }
            info!("Background refresher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::QueryState;
    use crate::error::FetchError;
    use crate::key::ResourceKey;
    use crate::lock;
    use crate::remote::{AbortSignal, RemoteSource};
    use crate::resource_key;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingRemote {
        fetched: Mutex<Vec<String>>,
        fail: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSource for CountingRemote {
        async fn fetch(&self, key: &ResourceKey, _abort: AbortSignal) -> Result<Value, FetchError> {
            lock(&self.fetched).push(key.canonical());
            if self.fail.load(Ordering::SeqCst) > 0 {
                return Err(FetchError::from_status(400, "bad"));
            }
            Ok(json!(key.canonical()))
        }

        async fn mutate(&self, _tag: &str, _variables: &Value) -> Result<Value, FetchError> {
            Ok(Value::Null)
        }
    }

    fn fetched(remote: &CountingRemote, key: &str) -> usize {
        lock(&remote.fetched).iter().filter(|k| k.as_str() == key).count()
    }

    #[tokio::test]
    async fn test_refreshes_only_observed_critical_keys() {
        let remote = Arc::new(CountingRemote::default());
        let engine = QueryEngine::in_memory(EngineConfig::default(), remote.clone()).unwrap();

        let mut roster = engine.subscribe(&resource_key!["roster", "list"]);
        let mut settings = engine.subscribe(&resource_key!["settings"]);
        roster.settled().await.unwrap().unwrap();
        settings.settled().await.unwrap().unwrap();
        // Cached but unobserved.
        engine.query(&resource_key!["schedule", 1i64]).await.unwrap();

        let refresher = BackgroundRefresher::new(
            engine.clone(),
            Duration::from_secs(60),
            vec!["schedule".to_string(), "roster".to_string()],
        );
        let report = refresher.run_once().await;

        assert_eq!(report.refreshed, 1);
        assert_eq!(fetched(&remote, "roster/list"), 2);
        assert_eq!(fetched(&remote, "settings"), 1);
        assert_eq!(fetched(&remote, "schedule/1"), 1);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let remote = Arc::new(CountingRemote::default());
        let engine = QueryEngine::in_memory(EngineConfig::default(), remote.clone()).unwrap();
        let mut sub = engine.subscribe(&resource_key!["schedule"]);
        sub.settled().await.unwrap().unwrap();

        remote.fail.store(1, Ordering::SeqCst);
        let refresher = BackgroundRefresher::new(engine, Duration::from_secs(60), vec!["schedule".to_string()]);
        let report = refresher.run_once().await;
        assert_eq!(report, RefreshReport { refreshed: 0, failed: 1, evicted: 0 });
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_subscriber_ready() {
        let remote = Arc::new(CountingRemote::default());
        let engine = QueryEngine::in_memory(EngineConfig::default(), remote.clone()).unwrap();
        let key = resource_key!["roster", "list"];
        let mut sub = engine.subscribe(&key);
        sub.settled().await.unwrap().unwrap();

        remote.fail.store(1, Ordering::SeqCst);
        let refresher =
            BackgroundRefresher::new(engine.clone(), Duration::from_secs(60), vec!["roster".to_string()]);
        let report = refresher.run_once().await;

        assert_eq!(report.failed, 1);
        assert_eq!(fetched(&remote, "roster/list"), 2);
        assert_eq!(sub.current(), QueryState::Ready(json!("roster/list")));
        assert!(engine.cached(&key).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_refresher_ticks_until_shutdown() {
        let remote = Arc::new(CountingRemote::default());
        let engine = QueryEngine::in_memory(EngineConfig::default(), remote.clone()).unwrap();
        let mut sub = engine.subscribe(&resource_key!["roster"]);
        sub.settled().await.unwrap().unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = BackgroundRefresher::new(engine, Duration::from_secs(60), vec!["roster".to_string()])
            .spawn(rx);
        tokio::time::sleep(Duration::from_secs(130)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(fetched(&remote, "roster"), 3);
    }
}
