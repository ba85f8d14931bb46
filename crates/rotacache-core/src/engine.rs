//! The query engine: cache-or-fetch decisions, coalescing, retries,
//! subscriptions, mutations and their invalidation fan-out.
//!
//! `QueryEngine` is a cheap handle (`Arc` inside). All registries are owned
//! by the engine and live exactly as long as it does.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adaptive::AdaptiveTracker;
use crate::analytics::{self, AnalyticsCollector, AnalyticsSummary, MutationEvent};
use crate::config::EngineConfig;
use crate::conflict::{ConflictResolver, ConflictStrategy, MergeFn};
use crate::error::FetchError;
use crate::inflight::{InFlightRegistry, SharedFetch};
use crate::key::ResourceKey;
use crate::lock;
use crate::observers::ObserverRegistry;
use crate::queue::{MutationPriority, OfflineQueue, PendingMutation, ReplayReport};
use crate::refresh::BackgroundRefresher;
use crate::remote::{AbortSignal, RemoteSource};
use crate::store::{CacheEntry, EntryMeta, PersistentStore, StoreStats};
use crate::strategy::{CacheStrategy, StrategyOverride};

/// Access stats idle this long are forgotten.
const ACCESS_STAT_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

/// What a subscriber currently sees for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
    Loading,
    Ready(Value),
    Failed(FetchError),
}

impl From<Result<Value, FetchError>> for QueryState {
    fn from(result: Result<Value, FetchError>) -> Self {
        match result {
            Ok(payload) => QueryState::Ready(payload),
            Err(e) => QueryState::Failed(e),
        }
    }
}

/// A live view of one key. Closed once the last observer unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    key: ResourceKey,
    rx: watch::Receiver<QueryState>,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn current(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<QueryState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state is no longer `Loading`.
    pub async fn settled(&mut self) -> Option<Result<Value, FetchError>> {
        let state = self
            .rx
            .wait_for(|s| !matches!(s, QueryState::Loading))
            .await
            .ok()?
            .clone();
        match state {
            QueryState::Ready(payload) => Some(Ok(payload)),
            QueryState::Failed(e) => Some(Err(e)),
            QueryState::Loading => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrefetchPriority {
    /// Start immediately.
    High,
    /// Start after `low_priority_prefetch_delay`.
    #[default]
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub tag: String,
    pub variables: Value,
    pub priority: MutationPriority,
    pub target: Option<ResourceKey>,
    /// When the client last saw `target`. Defaults to the cached entry's
    /// `fetched_at`.
    pub base_version_at: Option<DateTime<Utc>>,
    pub conflict_strategy: Option<ConflictStrategy>,
}

impl MutationRequest {
    pub fn new(tag: impl Into<String>, variables: Value) -> Self {
        Self {
            tag: tag.into(),
            variables,
            priority: MutationPriority::default(),
            target: None,
            base_version_at: None,
            conflict_strategy: None,
        }
    }

    pub fn with_priority(mut self, priority: MutationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: ResourceKey) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_base_version(mut self, at: DateTime<Utc>) -> Self {
        self.base_version_at = Some(at);
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The server accepted the mutation; its response.
    Applied(Value),
    /// Connectivity failed; the mutation waits in the offline queue.
    Queued(Uuid),
}

impl MutationOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued(_))
    }
}

enum Lookup {
    Hit(CacheEntry),
    Pending(SharedFetch),
}

/// How a read treats the cache and its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Serve a fresh entry if there is one.
    Cached,
    /// Always fetch.
    Refetch,
    /// Always fetch; a failure is returned but never published.
    Background,
}

impl ReadMode {
    fn bypass_fresh(self) -> bool {
        self != ReadMode::Cached
    }

    fn publishes_failure(self) -> bool {
        self != ReadMode::Background
    }
}

struct SubscriptionSlot {
    key: ResourceKey,
    tx: watch::Sender<QueryState>,
}

struct Inner {
    config: EngineConfig,
    remote: Arc<dyn RemoteSource>,
    store: PersistentStore,
    queue: OfflineQueue,
    observers: ObserverRegistry,
    inflight: InFlightRegistry,
    adaptive: Mutex<AdaptiveTracker>,
    /// Keys whose stored entry must be treated as stale regardless of age.
    force_stale: Mutex<HashSet<String>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSlot>>,
    resolver: Mutex<ConflictResolver>,
    analytics: Arc<AnalyticsCollector>,
    online: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<Inner>,
}

impl QueryEngine {
    /// Open an engine whose store and offline queue persist under `data_dir`.
    pub fn open(config: EngineConfig, remote: Arc<dyn RemoteSource>, data_dir: &Path) -> Result<Self> {
        config.validate()?;
        let observers = ObserverRegistry::new();
        let store = PersistentStore::open(data_dir, config.store_budget_bytes, observers.clone())?;
        let queue = OfflineQueue::open(data_dir)?;
        info!(dir = %data_dir.display(), "Opened query engine");
        Ok(Self::assemble(config, remote, store, queue, observers))
    }

    /// An engine that keeps everything in memory.
    pub fn in_memory(config: EngineConfig, remote: Arc<dyn RemoteSource>) -> Result<Self> {
        config.validate()?;
        let observers = ObserverRegistry::new();
        let store = PersistentStore::in_memory(config.store_budget_bytes, observers.clone());
        Ok(Self::assemble(config, remote, store, OfflineQueue::in_memory(), observers))
    }

    fn assemble(
        config: EngineConfig,
        remote: Arc<dyn RemoteSource>,
        store: PersistentStore,
        queue: OfflineQueue,
        observers: ObserverRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            adaptive: Mutex::new(AdaptiveTracker::new(config.adaptive.clone())),
            resolver: Mutex::new(ConflictResolver::new(config.conflict_strategy)),
            config,
            remote,
            store,
            queue,
            observers,
            inflight: InFlightRegistry::new(),
            force_stale: Mutex::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            analytics: Arc::new(AnalyticsCollector::new()),
            online: AtomicBool::new(true),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start the background refresher and the analytics reporter.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() {
            return;
        }
        let config = &self.inner.config;
        let refresher = BackgroundRefresher::new(
            self.clone(),
            config.refresh_interval,
            config.critical_patterns.clone(),
        );
        tasks.push(refresher.spawn(self.inner.shutdown.subscribe()));
        tasks.push(analytics::spawn_reporter(
            Arc::clone(&self.inner.analytics),
            config.analytics_interval,
            self.inner.shutdown.subscribe(),
        ));
        info!(
            refresh_interval_ms = config.refresh_interval.as_millis() as u64,
            critical = ?config.critical_patterns,
            "Background tasks started"
        );
    }

    /// Abort outstanding fetches, stop background tasks and flush state.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }
        self.inner.store.flush().await?;
        self.inner.queue.flush().await?;
        info!("Query engine shut down");
        Ok(())
    }

    // ----- reads -----

    /// Serve `key` from the cache if fresh, otherwise through `fetcher`.
    /// Concurrent calls for the same key share one fetch.
    pub async fn resolve<F, Fut>(
        &self,
        key: &ResourceKey,
        fetcher: F,
        strategy_override: StrategyOverride,
    ) -> Result<Value, FetchError>
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        self.resolve_with(key, fetcher, strategy_override, ReadMode::Cached).await
    }

    /// `resolve` through the engine's remote source with the table strategy.
    pub async fn query(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        self.resolve_with(key, self.remote_fetcher(key), StrategyOverride::Table, ReadMode::Cached)
            .await
    }

    /// Fetch `key` even if the cached entry is fresh. Still joins a fetch
    /// that is already in flight.
    pub async fn refetch(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        self.resolve_with(key, self.remote_fetcher(key), StrategyOverride::Table, ReadMode::Refetch)
            .await
    }

    /// `refetch` for background refresh: a failure is returned to the
    /// caller but subscribers keep their last state.
    pub async fn refresh(&self, key: &ResourceKey) -> Result<Value, FetchError> {
        self.resolve_with(key, self.remote_fetcher(key), StrategyOverride::Table, ReadMode::Background)
            .await
    }

    /// Warm the cache for `key` in the background. Errors are only logged.
    pub fn prefetch(&self, key: &ResourceKey, priority: PrefetchPriority) -> JoinHandle<()> {
        let engine = self.clone();
        let key = key.clone();
        let delay = match priority {
            PrefetchPriority::High => Duration::ZERO,
            PrefetchPriority::Low => self.inner.config.low_priority_prefetch_delay,
        };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = engine.query(&key).await {
                debug!(key = %key, error = %e, "Prefetch failed");
            }
        })
    }

    async fn resolve_with<F, Fut>(
        &self,
        key: &ResourceKey,
        fetcher: F,
        strategy_override: StrategyOverride,
        mode: ReadMode,
    ) -> Result<Value, FetchError>
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let inner = &self.inner;
        let canonical = key.canonical();
        let now = Utc::now();
        inner.analytics.record_query();
        let (strategy, stale_time) = self.plan(key, &canonical, &strategy_override, now);

        // Check-then-register happens under the registry lock.
        let lookup = {
            let mut registry = inner.inflight.lock();
            if let Some(existing) = registry.get(&canonical) {
                inner.analytics.record_coalesced();
                debug!(key = %canonical, "Joining in-flight fetch");
                Lookup::Pending(existing)
            } else {
                match self.fresh_entry(&canonical, now).filter(|_| !mode.bypass_fresh()) {
                    Some(entry) => Lookup::Hit(entry),
                    None => {
                        let id = registry.next_id();
                        let tags = strategy.tags.clone();
                        let meta = EntryMeta::from_strategy(&strategy, stale_time);
                        let fetch = self.spawn_fetch(key.clone(), id, fetcher, meta, mode);
                        registry.insert(canonical.clone(), id, fetch.clone(), tags);
                        debug!(key = %canonical, "Cache miss, fetching");
                        Lookup::Pending(fetch)
                    }
                }
            }
        };

        match lookup {
            Lookup::Hit(entry) => {
                inner.analytics.record_hit();
                debug!(key = %canonical, age = %entry.age_display(), "Cache hit");
                self.publish(&canonical, QueryState::Ready(entry.payload.clone()));
                Ok(entry.payload)
            }
            Lookup::Pending(fetch) => fetch.await,
        }
    }

    /// Strategy and effective stale time for this read; records the access.
    fn plan(
        &self,
        key: &ResourceKey,
        canonical: &str,
        strategy_override: &StrategyOverride,
        now: DateTime<Utc>,
    ) -> (CacheStrategy, Duration) {
        let table = &self.inner.config.strategies;
        let mut tracker = lock(&self.inner.adaptive);
        let (strategy, adapt) = match strategy_override {
            StrategyOverride::Static(strategy) => (strategy.clone(), false),
            StrategyOverride::Adaptive => (table.for_key(key).clone(), true),
            StrategyOverride::Table => (table.for_key(key).clone(), tracker.is_enabled()),
        };
        let stale_time = if adapt {
            tracker.effective_stale_time(canonical, &strategy, now)
        } else {
            strategy.stale_time
        };
        tracker.record_access(canonical, now);
        (strategy, stale_time)
    }

    fn fresh_entry(&self, canonical: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self.inner.store.retrieve(canonical)?;
        if entry.is_stale(now) || lock(&self.inner.force_stale).contains(canonical) {
            return None;
        }
        Some(entry)
    }

    fn remote_fetcher(
        &self,
        key: &ResourceKey,
    ) -> impl Fn(AbortSignal) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync + 'static
    {
        let remote = Arc::clone(&self.inner.remote);
        let key = key.clone();
        move |abort| {
            let remote = Arc::clone(&remote);
            let key = key.clone();
            async move { remote.fetch(&key, abort).await }.boxed()
        }
    }

    /// Run the fetch on its own task so it completes even if every caller
    /// goes away.
    fn spawn_fetch<F, Fut>(
        &self,
        key: ResourceKey,
        id: u64,
        fetcher: F,
        meta: EntryMeta,
        mode: ReadMode,
    ) -> SharedFetch
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let canonical = key.canonical();
            let started = Instant::now();
            let result = engine.fetch_with_retry(&canonical, &fetcher).await;
            engine
                .inner
                .analytics
                .record_fetch(started.elapsed(), result.is_ok());
            engine.finish_fetch(&key, &canonical, id, &result, meta, mode).await;
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(FetchError::Aborted),
                Err(e) => Err(FetchError::InvalidResponse(format!("fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch_with_retry<F, Fut>(&self, canonical: &str, fetcher: &F) -> Result<Value, FetchError>
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let policy = &self.inner.config.retry;
        let timeout = self.inner.config.request_timeout;
        let mut attempts = 0u32;

        loop {
            let mut abort = AbortSignal::new(self.inner.shutdown.subscribe());
            if abort.is_aborted() {
                return Err(FetchError::Aborted);
            }

            attempts += 1;
            let result = tokio::select! {
                result = tokio::time::timeout(timeout, fetcher(abort.clone())) => {
                    result.unwrap_or(Err(FetchError::Timeout))
                }
                _ = abort.aborted() => Err(FetchError::Aborted),
            };

            let error = match result {
                Ok(payload) => return Ok(payload),
                Err(e) => e,
            };
            if !policy.should_retry(&error, attempts) {
                return Err(error);
            }

            let delay = policy.backoff(attempts - 1);
            self.inner.analytics.record_retry();
            warn!(
                key = %canonical,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Fetch failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.aborted() => return Err(FetchError::Aborted),
            }
        }
    }

    async fn finish_fetch(
        &self,
        key: &ResourceKey,
        canonical: &str,
        id: u64,
        result: &Result<Value, FetchError>,
        meta: EntryMeta,
        mode: ReadMode,
    ) {
        let inner = &self.inner;

        match result {
            Ok(payload) => {
                // Store before the registration goes away, so a caller that
                // misses the registration finds the entry instead.
                let evicted = inner
                    .store
                    .insert(CacheEntry::new(key.clone(), payload.clone(), meta));
                inner.analytics.record_evictions(evicted.len());

                // Mark stale before the registration is released.
                let invalidated = {
                    let mut registry = inner.inflight.lock();
                    let invalidated = registry.take(canonical, id).unwrap_or(false);
                    let mut force_stale = lock(&inner.force_stale);
                    if invalidated {
                        force_stale.insert(canonical.to_string());
                    } else {
                        force_stale.remove(canonical);
                    }
                    invalidated
                };
                if invalidated {
                    debug!(key = %canonical, "Stored result of an invalidated fetch as stale");
                }
                self.note_connectivity(true);
            }
            Err(e) => {
                inner.inflight.complete(canonical, id);
                if e.is_connectivity() {
                    self.note_connectivity(false);
                }
            }
        }

        match result {
            Ok(payload) => {
                self.publish(canonical, QueryState::Ready(payload.clone()));
            }
            Err(e) if mode.publishes_failure() => {
                if !self.publish(canonical, QueryState::Failed(e.clone())) {
                    debug!(key = %canonical, error = %e, "Fetch failed with no observers");
                }
            }
            Err(e) => {
                debug!(key = %canonical, error = %e, "Background fetch failed, subscribers keep last state");
            }
        }

        if let Err(e) = inner.store.flush().await {
            error!(error = %e, "Failed to persist cache store");
        }
    }

    /// Deliver `state` to the key's subscribers. False if it has none.
    fn publish(&self, canonical: &str, state: QueryState) -> bool {
        let subscriptions = lock(&self.inner.subscriptions);
        let Some(slot) = subscriptions.get(canonical) else {
            return false;
        };
        slot.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        true
    }

    // ----- subscriptions -----

    /// Observe `key`. The subscription starts with the cached payload (if
    /// any) and a resolve runs in the background.
    pub fn subscribe(&self, key: &ResourceKey) -> Subscription {
        let canonical = key.canonical();
        let (rx, observers) = {
            let mut subscriptions = lock(&self.inner.subscriptions);
            let observers = self.inner.observers.add(&canonical);
            let slot = subscriptions.entry(canonical.clone()).or_insert_with(|| {
                let initial = match self.inner.store.retrieve(&canonical) {
                    Some(entry) => QueryState::Ready(entry.payload),
                    None => QueryState::Loading,
                };
                SubscriptionSlot {
                    key: key.clone(),
                    tx: watch::channel(initial).0,
                }
            });
            (slot.tx.subscribe(), observers)
        };
        debug!(key = %canonical, observers, "Subscribed");

        self.spawn_query(key.clone());
        Subscription { key: key.clone(), rx }
    }

    /// Drop one observer of `key`. Returns the observers left. When none
    /// are left, a fetch still in flight completes into the store only.
    pub fn unsubscribe(&self, key: &ResourceKey) -> usize {
        let canonical = key.canonical();
        let mut subscriptions = lock(&self.inner.subscriptions);
        let remaining = self.inner.observers.remove(&canonical);
        if remaining == 0 {
            subscriptions.remove(&canonical);
        }
        debug!(key = %canonical, remaining, "Unsubscribed");
        remaining
    }

    fn spawn_query(&self, key: ResourceKey) {
        let engine = self.clone();
        tokio::spawn(async move {
            // Results reach the subscription through publish.
            if let Err(e) = engine.query(&key).await {
                debug!(key = %key, error = %e, "Initial query for subscription failed");
            }
        });
    }

    /// Observed keys whose canonical form contains any of `patterns`.
    pub fn observed_keys_matching(&self, patterns: &[String]) -> Vec<ResourceKey> {
        lock(&self.inner.subscriptions)
            .iter()
            .filter(|(canonical, _)| patterns.iter().any(|p| canonical.contains(p.as_str())))
            .map(|(_, slot)| slot.key.clone())
            .collect()
    }

    pub fn observer_count(&self, key: &ResourceKey) -> usize {
        self.inner.observers.count(&key.canonical())
    }

    // ----- mutations -----

    pub async fn mutate(&self, tag: &str, variables: Value) -> Result<MutationOutcome, FetchError> {
        self.mutate_with(MutationRequest::new(tag, variables)).await
    }

    /// Send a mutation. On success the tag's invalidation rule runs; on a
    /// connectivity failure the mutation is queued and `Queued` returned.
    /// Every other failure is returned to the caller.
    pub async fn mutate_with(&self, request: MutationRequest) -> Result<MutationOutcome, FetchError> {
        let inner = &self.inner;
        let result = match tokio::time::timeout(
            inner.config.request_timeout,
            inner.remote.mutate(&request.tag, &request.variables),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        match result {
            Ok(response) => {
                self.note_connectivity(true);
                inner.analytics.record_mutation(MutationEvent::Applied);
                info!(tag = %request.tag, "Mutation applied");
                self.invalidate_for_tag(&request.tag).await;
                Ok(MutationOutcome::Applied(response))
            }
            Err(e) if e.is_connectivity() => {
                self.note_connectivity(false);
                let id = self.enqueue(request).await;
                inner.analytics.record_mutation(MutationEvent::Queued);
                info!(id = %id, error = %e, "Mutation queued for offline replay");
                Ok(MutationOutcome::Queued(id))
            }
            Err(e) => {
                inner.analytics.record_mutation(MutationEvent::Failed);
                warn!(tag = %request.tag, error = %e, "Mutation failed");
                Err(e)
            }
        }
    }

    async fn enqueue(&self, request: MutationRequest) -> Uuid {
        let base_version_at = request.base_version_at.or_else(|| {
            request
                .target
                .as_ref()
                .and_then(|t| self.inner.store.retrieve(&t.canonical()))
                .map(|entry| entry.fetched_at)
        });

        let mut mutation = PendingMutation::new(
            request.tag,
            request.variables,
            self.inner.config.mutation_max_retries,
        )
        .with_priority(request.priority)
        .with_conflict_strategy(request.conflict_strategy);
        if let Some(target) = request.target {
            mutation = mutation.with_target(target, base_version_at);
        }

        let id = mutation.id;
        // The mutation is queued in memory even if the write fails.
        if let Err(e) = self.inner.queue.enqueue(mutation).await {
            error!(id = %id, error = %e, "Failed to persist offline queue");
        }
        id
    }

    /// Register the merge function used by `ConflictStrategy::Merge` for
    /// mutations tagged `tag`.
    pub fn register_merge(&self, tag: impl Into<String>, merge: MergeFn) {
        lock(&self.inner.resolver).register_merge(tag, merge);
    }

    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.inner.queue.list()
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.inner.queue.clear().await
    }

    // ----- connectivity -----

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn mark_offline(&self) {
        if self.inner.online.swap(false, Ordering::SeqCst) {
            info!("Connectivity lost");
        }
    }

    /// Mark the engine online and replay the offline queue.
    pub async fn reconnect(&self) -> Result<ReplayReport> {
        self.inner.online.store(true, Ordering::SeqCst);
        if self.inner.queue.is_empty() {
            return Ok(ReplayReport::default());
        }
        info!(pending = self.inner.queue.len(), "Replaying offline queue");

        let resolver = lock(&self.inner.resolver).clone();
        let report = self
            .inner
            .queue
            .replay(self.inner.remote.as_ref(), &resolver, self.inner.config.request_timeout)
            .await?;

        let analytics = &self.inner.analytics;
        for replayed in &report.succeeded {
            analytics.record_mutation(MutationEvent::Replayed);
            self.invalidate_for_tag(&replayed.mutation.mutation_tag).await;
        }
        for _ in &report.dropped {
            analytics.record_mutation(MutationEvent::Dropped);
        }
        for _ in &report.exhausted {
            analytics.record_mutation(MutationEvent::Exhausted);
        }
        if let Some((_, e)) = &report.retrying {
            if e.is_connectivity() {
                self.mark_offline();
            }
        }

        info!(
            replayed = report.succeeded.len(),
            dropped = report.dropped.len(),
            exhausted = report.exhausted.len(),
            remaining = self.inner.queue.len(),
            "Offline replay finished"
        );
        Ok(report)
    }

    /// Track connectivity from fetch and mutation outcomes. Coming back
    /// online with a non-empty queue starts a replay.
    fn note_connectivity(&self, reachable: bool) {
        if !reachable {
            self.mark_offline();
            return;
        }
        let was_online = self.inner.online.swap(true, Ordering::SeqCst);
        if !was_online && !self.inner.queue.is_empty() {
            self.spawn_replay();
        }
    }

    fn spawn_replay(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.reconnect().await {
                error!(error = %e, "Offline replay failed");
            }
        });
    }

    // ----- invalidation -----

    async fn invalidate_for_tag(&self, tag: &str) {
        let patterns = self.inner.config.invalidation.route(tag).to_vec();
        if patterns.is_empty() {
            debug!(tag, "No invalidation rule for mutation tag");
            return;
        }
        if let Err(e) = self.invalidate(&patterns).await {
            error!(tag, error = %e, "Failed to persist invalidation");
        }
    }

    /// Invalidate everything matching `patterns`: in-flight fetches are
    /// flagged so their results land stale, store entries whose tags or
    /// canonical key match are removed, and observed matching keys are
    /// refetched. Returns the number of entries removed.
    pub async fn invalidate(&self, patterns: &[String]) -> Result<usize> {
        let inner = &self.inner;
        let mut flagged = 0;
        for pattern in patterns {
            flagged += inner.inflight.mark_invalidated(pattern);
        }

        let mut removed = inner.store.remove_by_tags(patterns).await?;
        for pattern in patterns {
            removed.extend(inner.store.remove_matching(pattern).await?);
        }

        let observed = self.observed_keys_matching(patterns);
        info!(
            patterns = ?patterns,
            removed = removed.len(),
            in_flight = flagged,
            refetching = observed.len(),
            "Invalidated cache entries"
        );
        for key in observed {
            self.spawn_refetch(key);
        }
        Ok(removed.len())
    }

    fn spawn_refetch(&self, key: ResourceKey) {
        let engine = self.clone();
        tokio::spawn(async move {
            // Let a flagged fetch land first, then fetch current data.
            let pending = engine.inner.inflight.get(&key.canonical());
            if let Some(pending) = pending {
                let _ = pending.await;
            }
            if let Err(e) = engine.refetch(&key).await {
                warn!(key = %key, error = %e, "Refetch after invalidation failed");
            }
        });
    }

    // ----- maintenance and introspection -----

    /// Drop unobserved entries past retention and idle access stats.
    pub async fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();
        lock(&self.inner.adaptive).prune(now, ACCESS_STAT_MAX_IDLE);
        let evicted = self.inner.store.evict_expired(now).await?;
        self.inner.analytics.record_evictions(evicted);
        Ok(evicted)
    }

    /// Evict unobserved entries, oldest first, down to `target_count`.
    pub async fn trim(&self, target_count: usize) -> Result<usize> {
        let evicted = self.inner.store.evict_least_recently_used(target_count).await?;
        self.inner.analytics.record_evictions(evicted);
        Ok(evicted)
    }

    pub async fn clear_cache(&self) -> Result<()> {
        lock(&self.inner.force_stale).clear();
        self.inner.store.clear().await
    }

    pub fn cached(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.inner.store.retrieve(&key.canonical())
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.store.entries()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    pub fn analytics(&self) -> AnalyticsSummary {
        self.inner.analytics.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.inflight.len()
    }
}
