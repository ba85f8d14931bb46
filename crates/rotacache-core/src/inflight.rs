//! Registry of outstanding fetches, one per canonical key.
//!
//! Callers that find a registration await the same shared result instead of
//! issuing a second request. The fetch itself runs on its own task and
//! removes its registration when it finishes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use futures::future::{BoxFuture, Shared};
use serde_json::Value;

use crate::error::FetchError;
use crate::lock;

pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

struct Registration {
    id: u64,
    fetch: SharedFetch,
    tags: BTreeSet<String>,
    invalidated: bool,
}

#[derive(Default)]
pub struct RegistryState {
    entries: HashMap<String, Registration>,
    next_id: u64,
}

impl RegistryState {
    pub fn get(&self, key: &str) -> Option<SharedFetch> {
        self.entries.get(key).map(|r| r.fetch.clone())
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, key: String, id: u64, fetch: SharedFetch, tags: BTreeSet<String>) {
        self.entries.insert(
            key,
            Registration {
                id,
                fetch,
                tags,
                invalidated: false,
            },
        );
    }

    /// Remove the registration made with `id`. Returns whether it was
    /// invalidated while in flight; `None` if it is no longer registered.
    pub fn take(&mut self, key: &str, id: u64) -> Option<bool> {
        match self.entries.get(key) {
            Some(reg) if reg.id == id => self.entries.remove(key).map(|r| r.invalidated),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct InFlightRegistry {
    state: Mutex<RegistryState>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for a check-then-register sequence. Never hold the
    /// guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.state)
    }

    pub fn get(&self, key: &str) -> Option<SharedFetch> {
        self.lock().get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn complete(&self, key: &str, id: u64) -> Option<bool> {
        self.lock().take(key, id)
    }

    /// Flag registrations whose key contains `pattern` or whose tags include
    /// it. Their results will be stored as already stale.
    pub fn mark_invalidated(&self, pattern: &str) -> usize {
        let mut state = self.lock();
        let mut marked = 0;
        for (key, reg) in state.entries.iter_mut() {
            if key.contains(pattern) || reg.tags.contains(pattern) {
                reg.invalidated = true;
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready(value: Value) -> SharedFetch {
        async move { Ok(value) }.boxed().shared()
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_registered_fetch_is_shared() {
        let registry = InFlightRegistry::new();
        {
            let mut state = registry.lock();
            let id = state.next_id();
            state.insert("roster".into(), id, ready(Value::from(7)), tags(&["roster"]));
        }
        let a = registry.get("roster").unwrap();
        let b = registry.get("roster").unwrap();
        assert_eq!(a.await.unwrap(), b.await.unwrap());
    }

    #[test]
    fn test_complete_requires_matching_id() {
        let registry = InFlightRegistry::new();
        let id = {
            let mut state = registry.lock();
            let id = state.next_id();
            state.insert("roster".into(), id, ready(Value::Null), tags(&["roster"]));
            id
        };
        assert_eq!(registry.complete("roster", id + 1), None);
        assert!(registry.contains("roster"));
        assert_eq!(registry.complete("roster", id), Some(false));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mark_invalidated_by_substring_and_tag() {
        let registry = InFlightRegistry::new();
        {
            let mut state = registry.lock();
            for (key, tag) in [("roster/list", "roster"), ("team/7", "schedule"), ("settings", "settings")] {
                let id = state.next_id();
                state.insert(key.into(), id, ready(Value::Null), tags(&[tag]));
            }
        }
        assert_eq!(registry.mark_invalidated("roster"), 1);
        assert_eq!(registry.mark_invalidated("schedule"), 1);

        let state = registry.lock();
        let id = state.entries["team/7"].id;
        drop(state);
        assert_eq!(registry.complete("team/7", id), Some(true));
    }
}
