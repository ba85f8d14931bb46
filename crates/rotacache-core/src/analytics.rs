//! Query and mutation counters.
//!
//! Everything here is a relaxed atomic; recording can never fail or block,
//! so the engine calls it inline on every path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::stopped;

/// How a mutation ended, from the collector's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    Applied,
    Failed,
    Queued,
    Replayed,
    Dropped,
    Exhausted,
}

#[derive(Debug, Default)]
pub struct AnalyticsCollector {
    queries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    network_fetches: AtomicU64,
    coalesced: AtomicU64,
    retries: AtomicU64,
    evictions: AtomicU64,
    mutations_applied: AtomicU64,
    mutations_failed: AtomicU64,
    mutations_queued: AtomicU64,
    mutations_replayed: AtomicU64,
    mutations_dropped: AtomicU64,
    mutations_exhausted: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsSummary {
    pub queries: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub network_fetches: u64,
    pub coalesced: u64,
    pub retries: u64,
    pub evictions: u64,
    pub mutations_applied: u64,
    pub mutations_failed: u64,
    pub mutations_queued: u64,
    pub mutations_replayed: u64,
    pub mutations_dropped: u64,
    pub mutations_exhausted: u64,
    /// Cache hits over queries (0.0 to 1.0).
    pub hit_rate: f64,
    /// Mean latency of network fetches.
    pub mean_latency_ms: f64,
    pub max_latency_ms: u64,
}

impl AnalyticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    /// A query answered from the store.
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// A query that joined a fetch already in flight.
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// A completed network fetch and how long it took, retries included.
    pub fn record_fetch(&self, latency: Duration, ok: bool) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        let ms = latency.as_millis().min(u64::MAX as u128) as u64;
        self.latency_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(ms, Ordering::Relaxed);
        self.record_outcome(ok);
    }

    /// Outcome of a query that did not come from the store.
    pub fn record_outcome(&self, ok: bool) {
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_mutation(&self, event: MutationEvent) {
        let counter = match event {
            MutationEvent::Applied => &self.mutations_applied,
            MutationEvent::Failed => &self.mutations_failed,
            MutationEvent::Queued => &self.mutations_queued,
            MutationEvent::Replayed => &self.mutations_replayed,
            MutationEvent::Dropped => &self.mutations_dropped,
            MutationEvent::Exhausted => &self.mutations_exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AnalyticsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let queries = load(&self.queries);
        let cache_hits = load(&self.cache_hits);
        let network_fetches = load(&self.network_fetches);

        let hit_rate = if queries == 0 {
            0.0
        } else {
            cache_hits as f64 / queries as f64
        };
        let mean_latency_ms = if network_fetches == 0 {
            0.0
        } else {
            load(&self.latency_sum_ms) as f64 / network_fetches as f64
        };

        AnalyticsSummary {
            queries,
            successes: load(&self.successes),
            failures: load(&self.failures),
            cache_hits,
            network_fetches,
            coalesced: load(&self.coalesced),
            retries: load(&self.retries),
            evictions: load(&self.evictions),
            mutations_applied: load(&self.mutations_applied),
            mutations_failed: load(&self.mutations_failed),
            mutations_queued: load(&self.mutations_queued),
            mutations_replayed: load(&self.mutations_replayed),
            mutations_dropped: load(&self.mutations_dropped),
            mutations_exhausted: load(&self.mutations_exhausted),
            hit_rate,
            mean_latency_ms,
            max_latency_ms: load(&self.latency_max_ms),
        }
    }
}

/// Log a summary every `interval` until `shutdown` flips to true.
pub fn spawn_reporter(
    collector: Arc<AnalyticsCollector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = collector.snapshot();
                    info!(
                        queries = s.queries,
                        hit_rate = s.hit_rate,
                        network_fetches = s.network_fetches,
                        failures = s.failures,
                        mean_latency_ms = s.mean_latency_ms,
                        mutations_applied = s.mutations_applied,
                        mutations_queued = s.mutations_queued,
                        "Cache analytics"
                    );
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_and_latency() {
        let analytics = AnalyticsCollector::new();
        for _ in 0..4 {
            analytics.record_query();
        }
        analytics.record_hit();
        analytics.record_fetch(Duration::from_millis(100), true);
        analytics.record_fetch(Duration::from_millis(300), false);

        let s = analytics.snapshot();
        assert_eq!(s.queries, 4);
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.network_fetches, 2);
        assert_eq!(s.successes, 2);
        assert_eq!(s.failures, 1);
        assert!((s.hit_rate - 0.25).abs() < f64::EPSILON);
        assert!((s.mean_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(s.max_latency_ms, 300);
    }

    #[test]
    fn test_empty_snapshot_has_no_nan() {
        let s = AnalyticsCollector::new().snapshot();
        assert_eq!(s.hit_rate, 0.0);
        assert_eq!(s.mean_latency_ms, 0.0);
    }

    #[test]
    fn test_mutation_events() {
        let analytics = AnalyticsCollector::new();
        analytics.record_mutation(MutationEvent::Queued);
        analytics.record_mutation(MutationEvent::Replayed);
        analytics.record_mutation(MutationEvent::Dropped);
        let s = analytics.snapshot();
        assert_eq!(s.mutations_queued, 1);
        assert_eq!(s.mutations_replayed, 1);
        assert_eq!(s.mutations_dropped, 1);
        assert_eq!(s.mutations_applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn_reporter(Arc::new(AnalyticsCollector::new()), Duration::from_secs(60), rx);
        tokio::time::sleep(Duration::from_secs(125)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
