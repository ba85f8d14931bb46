//! Durable queue of mutations that failed for connectivity reasons.
//!
//! Each mutation moves `Enqueued -> Attempting -> Succeeded` (removed),
//! back to `Enqueued` on a retryable failure, or to `FailedExhausted`
//! (removed and reported) once its retries are used up or the failure is
//! permanent. Replay drains strictly by priority class, then enqueue order,
//! and stops at the first retryable failure so nothing is reordered.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conflict::{ConflictResolver, ConflictStrategy, Resolution};
use crate::error::FetchError;
use crate::key::ResourceKey;
use crate::lock;
use crate::persist::{load_versioned, write_atomic};
use crate::remote::RemoteSource;

pub const QUEUE_SCHEMA_VERSION: u32 = 1;

const QUEUE_FILE: &str = "offline_queue.json";

/// Drain order: `High` first, `Low` last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationPriority {
    High,
    #[default]
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Enqueued,
    Attempting,
    Succeeded,
    FailedRetryable,
    FailedExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub mutation_tag: String,
    pub variables: Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub priority: MutationPriority,
    pub state: MutationState,
    /// Resource this mutation updates, checked for server-side changes.
    pub target: Option<ResourceKey>,
    /// When the client last saw `target`; defaults to `enqueued_at`.
    pub base_version_at: Option<DateTime<Utc>>,
    pub conflict_strategy: Option<ConflictStrategy>,
    /// FIFO position, assigned by the queue.
    #[serde(default)]
    seq: u64,
}

impl PendingMutation {
    /// A mutation whose first attempt already failed.
    pub fn new(tag: impl Into<String>, variables: Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            mutation_tag: tag.into(),
            variables,
            enqueued_at: Utc::now(),
            attempt_count: 1,
            max_retries,
            priority: MutationPriority::default(),
            state: MutationState::Enqueued,
            target: None,
            base_version_at: None,
            conflict_strategy: None,
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: MutationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: ResourceKey, base_version_at: Option<DateTime<Utc>>) -> Self {
        self.target = Some(target);
        self.base_version_at = base_version_at;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: Option<ConflictStrategy>) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_retries
    }

    fn base_version(&self) -> DateTime<Utc> {
        self.base_version_at.unwrap_or(self.enqueued_at)
    }
}

/// A mutation replayed successfully, with the server's response.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedMutation {
    pub mutation: PendingMutation,
    pub response: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Ids in the order they were attempted.
    pub attempted: Vec<Uuid>,
    pub succeeded: Vec<ReplayedMutation>,
    /// Lost a conflict to the server state.
    pub dropped: Vec<PendingMutation>,
    /// Permanently failed.
    pub exhausted: Vec<(PendingMutation, FetchError)>,
    /// Failed but will be retried; the drain stopped here.
    pub retrying: Option<(PendingMutation, FetchError)>,
}

impl ReplayReport {
    pub fn is_complete(&self) -> bool {
        self.retrying.is_none()
    }
}

enum AttemptOutcome {
    Applied(Value),
    Dropped,
    Failed(FetchError),
}

#[derive(Default, Serialize, Deserialize)]
struct QueueState {
    schema_version: u32,
    mutations: Vec<PendingMutation>,
    next_seq: u64,
    #[serde(skip)]
    version: u64,
}

impl QueueState {
    fn sort(&mut self) {
        self.mutations.sort_by_key(|m| (m.priority, m.seq));
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.mutations.iter().position(|m| m.id == id)
    }
}

pub struct OfflineQueue {
    path: Option<PathBuf>,
    state: Mutex<QueueState>,
    flushed: tokio::sync::Mutex<u64>,
    /// Only one drain at a time.
    replaying: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(QUEUE_FILE);
        let mut state = load_versioned::<QueueState>(&path, QUEUE_SCHEMA_VERSION)?.unwrap_or_default();

        // A crash mid-attempt leaves mutations in `Attempting`.
        for m in state.mutations.iter_mut() {
            if m.state != MutationState::Enqueued {
                m.state = MutationState::Enqueued;
            }
        }
        state.sort();
        if !state.mutations.is_empty() {
            info!(pending = state.mutations.len(), "Offline queue loaded");
        }

        Ok(Self {
            path: Some(path),
            ..Self::with_state(state)
        })
    }

    pub fn in_memory() -> Self {
        Self::with_state(QueueState::default())
    }

    fn with_state(state: QueueState) -> Self {
        Self {
            path: None,
            state: Mutex::new(state),
            flushed: tokio::sync::Mutex::new(0),
            replaying: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn enqueue(&self, mut mutation: PendingMutation) -> Result<Uuid> {
        let id = mutation.id;
        {
            let mut state = lock(&self.state);
            state.next_seq += 1;
            mutation.seq = state.next_seq;
            mutation.state = MutationState::Enqueued;
            debug!(id = %id, tag = %mutation.mutation_tag, priority = ?mutation.priority, "Queued mutation for replay");
            state.mutations.push(mutation);
            state.sort();
            state.version += 1;
        }
        self.flush().await?;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending mutations in drain order.
    pub fn list(&self) -> Vec<PendingMutation> {
        lock(&self.state).mutations.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<PendingMutation> {
        let state = lock(&self.state);
        state.position(id).map(|i| state.mutations[i].clone())
    }

    pub async fn remove(&self, id: Uuid) -> Result<Option<PendingMutation>> {
        let removed = self.take(id);
        self.flush().await?;
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.mutations.clear();
            state.version += 1;
        }
        self.flush().await
    }

    /// Drain the queue against `remote`.
    pub async fn replay(
        &self,
        remote: &dyn RemoteSource,
        resolver: &ConflictResolver,
        attempt_timeout: Duration,
    ) -> Result<ReplayReport> {
        let _draining = self.replaying.lock().await;
        let mut report = ReplayReport::default();

        while let Some(mutation) = self.begin_next() {
            self.flush().await?;
            report.attempted.push(mutation.id);
            debug!(id = %mutation.id, tag = %mutation.mutation_tag, attempt = mutation.attempt_count, "Replaying mutation");

            match Self::attempt(&mutation, remote, resolver, attempt_timeout).await {
                AttemptOutcome::Applied(response) => {
                    self.take(mutation.id);
                    let mut mutation = mutation;
                    mutation.state = MutationState::Succeeded;
                    info!(id = %mutation.id, tag = %mutation.mutation_tag, "Replayed mutation");
                    report.succeeded.push(ReplayedMutation { mutation, response });
                }
                AttemptOutcome::Dropped => {
                    self.take(mutation.id);
                    info!(id = %mutation.id, tag = %mutation.mutation_tag, "Server state won conflict, dropping mutation");
                    report.dropped.push(mutation);
                }
                AttemptOutcome::Failed(err) => {
                    let retryable = !err.is_client_error()
                        && !matches!(err, FetchError::Conflict(_))
                        && !mutation.is_exhausted();
                    if retryable {
                        self.set_state(mutation.id, MutationState::Enqueued);
                        warn!(id = %mutation.id, error = %err, "Replay failed, will retry later");
                        let mut mutation = mutation;
                        mutation.state = MutationState::FailedRetryable;
                        report.retrying = Some((mutation, err));
                        self.flush().await?;
                        break;
                    }

                    self.take(mutation.id);
                    let mut mutation = mutation;
                    mutation.state = MutationState::FailedExhausted;
                    warn!(id = %mutation.id, tag = %mutation.mutation_tag, error = %err, "Mutation failed permanently");
                    report.exhausted.push((mutation, err));
                }
            }
            self.flush().await?;
        }

        Ok(report)
    }

    /// Mark the first enqueued mutation as attempting and count the attempt.
    fn begin_next(&self) -> Option<PendingMutation> {
        let mut state = lock(&self.state);
        let next = state
            .mutations
            .iter_mut()
            .find(|m| m.state == MutationState::Enqueued)?;
        next.state = MutationState::Attempting;
        next.attempt_count += 1;
        let next = next.clone();
        state.version += 1;
        Some(next)
    }

    fn set_state(&self, id: Uuid, new_state: MutationState) {
        let mut state = lock(&self.state);
        if let Some(i) = state.position(id) {
            state.mutations[i].state = new_state;
            state.version += 1;
        }
    }

    fn take(&self, id: Uuid) -> Option<PendingMutation> {
        let mut state = lock(&self.state);
        let i = state.position(id)?;
        state.version += 1;
        Some(state.mutations.remove(i))
    }

    async fn attempt(
        mutation: &PendingMutation,
        remote: &dyn RemoteSource,
        resolver: &ConflictResolver,
        attempt_timeout: Duration,
    ) -> AttemptOutcome {
        let mut variables = mutation.variables.clone();

        if let Some(target) = &mutation.target {
            let server = match tokio::time::timeout(attempt_timeout, remote.server_state(target)).await {
                Ok(Ok(server)) => server,
                Ok(Err(e)) => return AttemptOutcome::Failed(e),
                Err(_) => return AttemptOutcome::Failed(FetchError::Timeout),
            };

            if let Some(server) = server.filter(|s| s.updated_at > mutation.base_version()) {
                debug!(id = %mutation.id, target = %target, "Server changed target since mutation was queued");
                match resolver.resolve(
                    &mutation.mutation_tag,
                    &mutation.variables,
                    mutation.enqueued_at,
                    &server,
                    mutation.conflict_strategy,
                ) {
                    Resolution::Apply(resolved) => variables = resolved,
                    Resolution::Drop => return AttemptOutcome::Dropped,
                    Resolution::Fail(e) => return AttemptOutcome::Failed(e),
                }
            }
        }

        match tokio::time::timeout(attempt_timeout, remote.mutate(&mutation.mutation_tag, &variables)).await {
            Ok(Ok(response)) => AttemptOutcome::Applied(response),
            Ok(Err(e)) => AttemptOutcome::Failed(e),
            Err(_) => AttemptOutcome::Failed(FetchError::Timeout),
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut flushed = self.flushed.lock().await;
        let (version, contents) = {
            let mut state = lock(&self.state);
            if state.version == *flushed {
                return Ok(());
            }
            state.schema_version = QUEUE_SCHEMA_VERSION;
            (state.version, serde_json::to_string(&*state)?)
        };

        write_atomic(path, contents).await?;
        *flushed = version;
        Ok(())
    }
}
