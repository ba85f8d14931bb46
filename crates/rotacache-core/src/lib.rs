//! rotacache core - a client-side caching and synchronization engine for a
//! rota/scheduling backend.
//!
//! The engine sits between observers and a remote resource server:
//! - Fetched resources are cached per key with domain-specific staleness
//!   and persisted across restarts under a byte budget
//! - Concurrent reads of one key share a single outbound fetch
//! - Mutations invalidate related keys; connectivity failures are queued
//!   and replayed later with conflict resolution
//! - Observed critical keys are refreshed in the background
//!
//! `QueryEngine` is the entry point; `HttpRemote` is the default
//! `RemoteSource`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

pub mod adaptive;
pub mod analytics;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod key;
pub mod observers;
mod persist;
pub mod queue;
pub mod refresh;
pub mod remote;
pub mod retry;
pub mod router;
pub mod store;
pub mod strategy;

pub use analytics::AnalyticsSummary;
pub use config::EngineConfig;
pub use conflict::{merge_fields, ConflictStrategy, MergeFn};
pub use engine::{
    MutationOutcome, MutationRequest, PrefetchPriority, QueryEngine, QueryState, Subscription,
};
pub use error::{ConfigError, FetchError};
pub use key::{KeySegment, ResourceKey};
pub use queue::{MutationPriority, PendingMutation, ReplayReport};
pub use remote::{AbortSignal, HttpRemote, RemoteSource, ServerState};
pub use store::{CacheEntry, StoreStats};
pub use strategy::{CacheStrategy, StrategyOverride};

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait until `shutdown` reads true or its sender is dropped. The borrowed
/// value is released before this returns.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
