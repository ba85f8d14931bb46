//! Persistent key -> entry store with a byte budget.
//!
//! Entries live in memory and are written through to `entries.json` in the
//! store directory after every change. The file carries a schema version;
//! a snapshot with any other version is discarded at open.
//!
//! When the byte budget is exceeded, entries without observers are evicted
//! oldest `fetched_at` first. Observed entries go only if that is not
//! enough, so the budget holds after every store.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::adaptive::elapsed;
use crate::config::duration_ms;
use crate::key::ResourceKey;
use crate::lock;
use crate::observers::ObserverRegistry;
use crate::persist::{load_versioned, write_atomic};
use crate::strategy::CacheStrategy;

pub const STORE_SCHEMA_VERSION: u32 = 1;

const ENTRIES_FILE: &str = "entries.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    #[serde(with = "duration_ms", rename = "stale_time_ms")]
    pub stale_time: Duration,
    #[serde(with = "duration_ms", rename = "retention_time_ms")]
    pub retention_time: Duration,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(key: ResourceKey, payload: Value, meta: EntryMeta) -> Self {
        Self {
            key,
            payload,
            fetched_at: Utc::now(),
            stale_time: meta.stale_time,
            retention_time: meta.retention_time,
            tags: meta.tags,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        elapsed(self.fetched_at, now) > self.stale_time
    }

    /// Past the retention window. Only evictable if also unobserved.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed(self.fetched_at, now) > self.retention_time
    }

    /// Approximate footprint: serialised payload plus key and tags.
    pub fn size_bytes(&self) -> u64 {
        let payload = serde_json::to_string(&self.payload)
            .map(|s| s.len())
            .unwrap_or(0);
        let key = self.key.canonical().len();
        let tags: usize = self.tags.iter().map(String::len).sum();
        (payload + key + tags) as u64
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.fetched_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

/// Strategy-derived metadata stored with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub stale_time: Duration,
    pub retention_time: Duration,
    pub tags: BTreeSet<String>,
}

impl EntryMeta {
    pub fn from_strategy(strategy: &CacheStrategy, stale_time: Duration) -> Self {
        Self {
            stale_time,
            retention_time: strategy.retention_time,
            tags: strategy.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    entries: Vec<CacheEntry>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, (CacheEntry, u64)>,
    bytes: u64,
    /// Bumped on every change; compared against the last flushed version.
    version: u64,
}

impl StoreState {
    fn insert(&mut self, canonical: String, entry: CacheEntry) {
        let size = entry.size_bytes();
        self.remove(&canonical);
        self.bytes += size;
        self.entries.insert(canonical, (entry, size));
        self.version += 1;
    }

    fn remove(&mut self, canonical: &str) -> bool {
        match self.entries.remove(canonical) {
            Some((_, size)) => {
                self.bytes = self.bytes.saturating_sub(size);
                self.version += 1;
                true
            }
            None => false,
        }
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&str, &CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, (e, _))| pred(k, e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed
    }
}

pub struct PersistentStore {
    dir: Option<PathBuf>,
    budget_bytes: u64,
    observers: ObserverRegistry,
    state: Mutex<StoreState>,
    /// Serialises snapshot writes; holds the last version written.
    flushed: tokio::sync::Mutex<u64>,
}

impl PersistentStore {
    /// Open (or create) a store under `dir`, loading any compatible snapshot.
    pub fn open(dir: &Path, budget_bytes: u64, observers: ObserverRegistry) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self {
            dir: Some(dir.to_path_buf()),
            ..Self::in_memory(budget_bytes, observers)
        };

        if let Some(snapshot) = load_versioned::<Snapshot>(&store.entries_path_in(dir), STORE_SCHEMA_VERSION)? {
            let mut state = lock(&store.state);
            for entry in snapshot.entries {
                state.insert(entry.key.canonical(), entry);
            }
            let evicted = store.enforce_budget(&mut state, None);
            info!(entries = state.entries.len(), bytes = state.bytes, evicted = evicted.len(), "Cache store loaded");
        }
        Ok(store)
    }

    /// A store that never touches disk.
    pub fn in_memory(budget_bytes: u64, observers: ObserverRegistry) -> Self {
        Self {
            dir: None,
            budget_bytes,
            observers,
            state: Mutex::new(StoreState::default()),
            flushed: tokio::sync::Mutex::new(0),
        }
    }

    fn entries_path_in(&self, dir: &Path) -> PathBuf {
        dir.join(ENTRIES_FILE)
    }

    /// Insert or replace the entry for `key`, evict to budget, persist.
    /// Returns the canonical keys evicted to make room.
    pub async fn store(&self, key: &ResourceKey, payload: Value, meta: EntryMeta) -> Result<Vec<String>> {
        let evicted = self.insert(CacheEntry::new(key.clone(), payload, meta));
        self.flush().await?;
        Ok(evicted)
    }

    /// In-memory half of `store`.
    pub fn insert(&self, entry: CacheEntry) -> Vec<String> {
        let canonical = entry.key.canonical();
        let size = entry.size_bytes();
        let mut state = lock(&self.state);

        if size > self.budget_bytes {
            warn!(key = %canonical, size, budget = self.budget_bytes, "Entry exceeds store budget, not caching");
            state.remove(&canonical);
            return Vec::new();
        }

        state.insert(canonical.clone(), entry);
        let evicted = self.enforce_budget(&mut state, Some(&canonical));
        if !evicted.is_empty() {
            debug!(count = evicted.len(), bytes = state.bytes, "Evicted entries to stay within budget");
        }
        evicted
    }

    pub fn retrieve(&self, canonical: &str) -> Option<CacheEntry> {
        lock(&self.state).entries.get(canonical).map(|(e, _)| e.clone())
    }

    pub fn contains(&self, canonical: &str) -> bool {
        lock(&self.state).entries.contains_key(canonical)
    }

    /// Remove every entry whose tags intersect `tags`.
    pub async fn remove_by_tags(&self, tags: &[String]) -> Result<Vec<String>> {
        let removed = lock(&self.state).remove_where(|_, e| tags.iter().any(|t| e.tags.contains(t)));
        self.flush().await?;
        Ok(removed)
    }

    /// Remove every entry whose canonical key contains `pattern`.
    pub async fn remove_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let removed = lock(&self.state).remove_where(|k, _| k.contains(pattern));
        self.flush().await?;
        Ok(removed)
    }

    /// Evict unobserved entries, oldest `fetched_at` first, until at most
    /// `target_count` remain. Observed entries are never touched here.
    pub async fn evict_least_recently_used(&self, target_count: usize) -> Result<usize> {
        let evicted = {
            let mut state = lock(&self.state);
            let excess = state.entries.len().saturating_sub(target_count);
            let mut candidates: Vec<(DateTime<Utc>, String)> = state
                .entries
                .iter()
                .filter(|(k, _)| !self.observers.is_observed(k))
                .map(|(k, (e, _))| (e.fetched_at, k.clone()))
                .collect();
            candidates.sort();
            let doomed: Vec<String> = candidates.into_iter().take(excess).map(|(_, k)| k).collect();
            for key in &doomed {
                state.remove(key);
            }
            doomed.len()
        };
        self.flush().await?;
        Ok(evicted)
    }

    /// Remove unobserved entries past their retention window.
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = lock(&self.state)
            .remove_where(|k, e| e.is_expired(now) && !self.observers.is_observed(k));
        self.flush().await?;
        Ok(removed.len())
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.entries.clear();
            state.bytes = 0;
            state.version += 1;
        }
        self.flush().await
    }

    pub fn stats(&self) -> StoreStats {
        let state = lock(&self.state);
        StoreStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            budget_bytes: self.budget_bytes,
        }
    }

    /// Entries in canonical-key order.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = lock(&self.state);
        let mut entries: Vec<CacheEntry> = state.entries.values().map(|(e, _)| e.clone()).collect();
        entries.sort_by_key(|e| e.key.canonical());
        entries
    }

    /// Write the current state to disk if it changed since the last write.
    pub async fn flush(&self) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let mut flushed = self.flushed.lock().await;
        // Re-read after acquiring the flush lock so the newest state wins.
        let (version, contents) = {
            let state = lock(&self.state);
            if state.version == *flushed {
                return Ok(());
            }
            let snapshot = Snapshot {
                schema_version: STORE_SCHEMA_VERSION,
                entries: state.entries.values().map(|(e, _)| e.clone()).collect(),
            };
            (state.version, serde_json::to_string(&snapshot)?)
        };

        write_atomic(&self.entries_path_in(dir), contents).await?;
        *flushed = version;
        Ok(())
    }

    fn enforce_budget(&self, state: &mut StoreState, protect: Option<&str>) -> Vec<String> {
        if state.bytes <= self.budget_bytes {
            return Vec::new();
        }

        // Unobserved before observed, then oldest first.
        let mut candidates: Vec<(bool, DateTime<Utc>, String)> = state
            .entries
            .iter()
            .filter(|(k, _)| Some(k.as_str()) != protect)
            .map(|(k, (e, _))| (self.observers.is_observed(k), e.fetched_at, k.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, _, key) in candidates {
            if state.bytes <= self.budget_bytes {
                break;
            }
            state.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_key;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn meta(tags: &[&str]) -> EntryMeta {
        EntryMeta {
            stale_time: Duration::from_secs(60),
            retention_time: Duration::from_secs(600),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn entry_at(key: ResourceKey, payload: Value, minutes_ago: i64) -> CacheEntry {
        let mut entry = CacheEntry::new(key, payload, meta(&["roster"]));
        entry.fetched_at = Utc::now() - ChronoDuration::minutes(minutes_ago);
        entry
    }

    #[test]
    fn test_entry_staleness_and_expiry() {
        let fresh = CacheEntry::new(resource_key!["roster"], json!([1]), meta(&["roster"]));
        assert!(!fresh.is_stale(Utc::now()));
        assert!(!fresh.is_expired(Utc::now()));

        let old = entry_at(resource_key!["roster"], json!([1]), 2);
        assert!(old.is_stale(Utc::now()));
        assert!(!old.is_expired(Utc::now()));

        let ancient = entry_at(resource_key!["roster"], json!([1]), 11);
        assert!(ancient.is_expired(Utc::now()));
    }

    #[test]
    fn test_age_display() {
        assert_eq!(entry_at(resource_key!["a"], Value::Null, 0).age_display(), "just now");
        assert_eq!(entry_at(resource_key!["a"], Value::Null, 5).age_display(), "5m ago");
        assert_eq!(entry_at(resource_key!["a"], Value::Null, 90).age_display(), "2h ago");
        assert_eq!(entry_at(resource_key!["a"], Value::Null, 1500).age_display(), "1d ago");
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let store = PersistentStore::in_memory(10_000, ObserverRegistry::new());
        let key = resource_key!["roster", "list"];
        store.store(&key, json!({"staff": 3}), meta(&["roster"])).await.unwrap();

        let entry = store.retrieve("roster/list").unwrap();
        assert_eq!(entry.payload, json!({"staff": 3}));
        assert_eq!(entry.key, key);
        assert!(store.retrieve("roster").is_none());
    }

    #[tokio::test]
    async fn test_store_replaces_whole_entry() {
        let store = PersistentStore::in_memory(10_000, ObserverRegistry::new());
        let key = resource_key!["roster"];
        store.store(&key, json!("a long first payload"), meta(&["roster"])).await.unwrap();
        store.store(&key, json!("b"), meta(&["other"])).await.unwrap();

        let entry = store.retrieve("roster").unwrap();
        assert_eq!(entry.payload, json!("b"));
        assert!(entry.tags.contains("other"));
        assert!(!entry.tags.contains("roster"));
        assert_eq!(store.stats().bytes, entry.size_bytes());
    }

    #[tokio::test]
    async fn test_remove_by_tags() {
        let store = PersistentStore::in_memory(10_000, ObserverRegistry::new());
        store.store(&resource_key!["roster", "list"], json!(1), meta(&["roster"])).await.unwrap();
        store.store(&resource_key!["schedule", 1i64], json!(2), meta(&["schedule"])).await.unwrap();
        store.store(&resource_key!["analytics"], json!(3), meta(&["analytics", "roster"])).await.unwrap();

        let removed = store.remove_by_tags(&["roster".to_string()]).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.retrieve("schedule/1").is_some());
        assert_eq!(store.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_remove_matching_is_substring() {
        let store = PersistentStore::in_memory(10_000, ObserverRegistry::new());
        store.store(&resource_key!["schedule-analytics", 3i64], json!(1), meta(&["analytics"])).await.unwrap();
        store.store(&resource_key!["roster"], json!(2), meta(&["roster"])).await.unwrap();

        let removed = store.remove_matching("schedule").await.unwrap();
        assert_eq!(removed, vec!["schedule-analytics/3".to_string()]);
    }

    #[test]
    fn test_budget_never_exceeded_and_oldest_unobserved_go_first() {
        let observers = ObserverRegistry::new();
        let store = PersistentStore::in_memory(120, observers.clone());
        observers.add("k/0");

        for i in 0..10i64 {
            let entry = entry_at(resource_key!["k", i], json!("0123456789"), 100 - i);
            store.insert(entry);
            assert!(store.stats().bytes <= 120);
        }

        // The observed, oldest entry survives; unobserved old ones went first.
        assert!(store.contains("k/0"));
        assert!(store.contains("k/9"));
        assert!(!store.contains("k/1"));
    }

    #[test]
    fn test_observed_entries_evicted_when_nothing_else_left() {
        let observers = ObserverRegistry::new();
        let store = PersistentStore::in_memory(30, observers.clone());
        observers.add("a");
        observers.add("b");
        store.insert(entry_at(resource_key!["a"], json!("0123456789"), 5));
        store.insert(entry_at(resource_key!["b"], json!("0123456789"), 1));
        assert!(store.stats().bytes <= 30);
        assert!(store.contains("b"));
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let store = PersistentStore::in_memory(8, ObserverRegistry::new());
        let evicted = store.insert(entry_at(resource_key!["big"], json!("way too large"), 0));
        assert!(evicted.is_empty());
        assert!(!store.contains("big"));
        assert_eq!(store.stats().bytes, 0);
    }

    #[tokio::test]
    async fn test_evict_least_recently_used_skips_observed() {
        let observers = ObserverRegistry::new();
        let store = PersistentStore::in_memory(10_000, observers.clone());
        observers.add("k/0");
        for i in 0..5i64 {
            store.insert(entry_at(resource_key!["k", i], json!(i), 50 - i));
        }

        let evicted = store.evict_least_recently_used(2).await.unwrap();
        assert_eq!(evicted, 3);
        assert!(store.contains("k/0"));
        assert!(store.contains("k/4"));
        assert!(!store.contains("k/1"));
    }

    #[tokio::test]
    async fn test_evict_expired_respects_observers() {
        let observers = ObserverRegistry::new();
        let store = PersistentStore::in_memory(10_000, observers.clone());
        store.insert(entry_at(resource_key!["old"], json!(1), 30));
        store.insert(entry_at(resource_key!["watched"], json!(1), 30));
        store.insert(entry_at(resource_key!["new"], json!(1), 0));
        observers.add("watched");

        assert_eq!(store.evict_expired(Utc::now()).await.unwrap(), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("watched"));
        assert!(store.contains("new"));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PersistentStore::open(dir.path(), 10_000, ObserverRegistry::new()).unwrap();
            store.store(&resource_key!["roster", "list"], json!({"n": 1}), meta(&["roster"])).await.unwrap();
        }
        let reopened = PersistentStore::open(dir.path(), 10_000, ObserverRegistry::new()).unwrap();
        let entry = reopened.retrieve("roster/list").unwrap();
        assert_eq!(entry.payload, json!({"n": 1}));
        assert!(entry.tags.contains("roster"));
    }

    #[tokio::test]
    async fn test_incompatible_snapshot_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(ENTRIES_FILE),
            r#"{"schema_version": 99, "entries": [{"whatever": true}]}"#,
        )
        .unwrap();
        let store = PersistentStore::open(dir.path(), 10_000, ObserverRegistry::new()).unwrap();
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistentStore::open(dir.path(), 10_000, ObserverRegistry::new()).unwrap();
        store.store(&resource_key!["roster"], json!(1), meta(&["roster"])).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.stats(), StoreStats { entries: 0, bytes: 0, budget_bytes: 10_000 });

        let reopened = PersistentStore::open(dir.path(), 10_000, ObserverRegistry::new()).unwrap();
        assert_eq!(reopened.stats().entries, 0);
    }
}
