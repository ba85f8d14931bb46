use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::lock;

/// Active subscriber count per canonical key.
///
/// Shared between the engine (which counts subscriptions) and the store
/// (which must not evict observed entries first). Clone is cheap.
#[derive(Debug, Clone, Default)]
pub struct ObserverRegistry {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count after adding one observer.
    pub fn add(&self, key: &str) -> usize {
        let mut counts = lock(&self.counts);
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the count after removing one observer. Never underflows.
    pub fn remove(&self, key: &str) -> usize {
        let mut counts = lock(&self.counts);
        match counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                counts.remove(key);
                0
            }
            None => 0,
        }
    }

    pub fn count(&self, key: &str) -> usize {
        lock(&self.counts).get(key).copied().unwrap_or(0)
    }

    pub fn is_observed(&self, key: &str) -> bool {
        self.count(key) > 0
    }

    /// Canonical keys with at least one observer.
    pub fn active_keys(&self) -> Vec<String> {
        lock(&self.counts).keys().cloned().collect()
    }
}
