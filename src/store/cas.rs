use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ClaimOutcome, ClaimRequest, ModelState, QueueStats, QueueStore, ReclaimReport};
use crate::budget::{BudgetPolicy, BudgetUpdate, TokenBudget};
use crate::error::StoreError;
use crate::request::{InstanceId, RequestId, RequestRecord};

/// Attempts before a transition reports [`StoreError::Contention`].
pub const DEFAULT_CAS_ATTEMPTS: usize = 16;

/// State read together with the version it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub state: ModelState,
}

/// Versioned key/value storage for per-model state.
///
/// Designed for distributed backends that can compare-and-set a whole value atomically
/// (a Lua script, a transaction, a conditional put).
#[async_trait]
pub trait StateBackend: Send + Sync + std::fmt::Debug {
    /// Fetch the current state for a key.
    async fn get_state(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `state` if the stored version still equals `prev_version` (`None`: the key must
    /// not exist yet). The new version is `prev_version + 1`.
    ///
    /// Returns `Ok(true)` if the write succeeded, `Ok(false)` if another writer got there first.
    async fn set_state(
        &self,
        key: &str,
        state: &ModelState,
        prev_version: Option<u64>,
    ) -> Result<bool, StoreError>;
}

/// [`QueueStore`] running every transition as an optimistic read-modify-write loop.
#[derive(Debug)]
pub struct CasQueueStore<B> {
    backend: Arc<B>,
    prefix: String,
    max_attempts: usize,
}

impl<B> Clone for CasQueueStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            prefix: self.prefix.clone(),
            max_attempts: self.max_attempts,
        }
    }
}

impl<B: StateBackend> CasQueueStore<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self { backend, prefix: "lmqueue".to_string(), max_attempts: DEFAULT_CAS_ATTEMPTS }
    }

    /// Namespace for backend keys (`{prefix}:{model_key}`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Attempts before giving up with `Contention`; at least one.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key(&self, model_key: &str) -> String {
        format!("{}:{}", self.prefix, model_key)
    }

    /// Run `op` against the latest state and commit it if the version did not move.
    /// Unchanged state is not written back.
    async fn transact<T, F>(&self, model_key: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut ModelState) -> T + Send,
        T: Send,
    {
        let key = self.key(model_key);
        for attempt in 1..=self.max_attempts {
            let current = self.backend.get_state(&key).await?;
            let (prev_version, before) = match current {
                Some(Versioned { version, state }) => (Some(version), state),
                None => (None, ModelState::default()),
            };
            let mut after = before.clone();
            let out = op(&mut after);
            if after == before {
                return Ok(out);
            }
            if self.backend.set_state(&key, &after, prev_version).await? {
                return Ok(out);
            }
            debug!(target: "lmqueue::store", key = %key, attempt, "compare-and-set lost the race; retrying");
        }
        warn!(target: "lmqueue::store", key = %key, attempts = self.max_attempts, "compare-and-set contention; giving up");
        Err(StoreError::Contention { key, attempts: self.max_attempts })
    }
}

#[async_trait]
impl<B: StateBackend> QueueStore for CasQueueStore<B> {
    async fn enqueue(&self, record: RequestRecord, now: u64) -> Result<(), StoreError> {
        let key = record.model_key.clone();
        self.transact(&key, |s| s.enqueue(record.clone(), now)).await
    }

    async fn try_claim_head(
        &self,
        model_key: &str,
        claim: &ClaimRequest,
        now: u64,
    ) -> Result<ClaimOutcome, StoreError> {
        self.transact(model_key, |s| s.try_claim_head(claim, now)).await
    }

    async fn remove(
        &self,
        model_key: &str,
        id: RequestId,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.transact(model_key, |s| s.remove(id)).await
    }

    async fn release(
        &self,
        model_key: &str,
        id: RequestId,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.transact(model_key, |s| s.release(id, policy, now)).await
    }

    async fn requeue_front(&self, model_key: &str, id: RequestId) -> Result<bool, StoreError> {
        self.transact(model_key, |s| s.requeue_front(id)).await
    }

    async fn budget(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError> {
        let state = self.backend.get_state(&self.key(model_key)).await?;
        Ok(state.map(|v| v.state).unwrap_or_default().projected_budget(policy, now))
    }

    async fn update_budget(
        &self,
        model_key: &str,
        update: &BudgetUpdate,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError> {
        self.transact(model_key, |s| s.update_budget(update, policy, now)).await
    }

    async fn heartbeat(
        &self,
        model_key: &str,
        instance: &InstanceId,
        in_flight: &[RequestId],
        now: u64,
    ) -> Result<(), StoreError> {
        self.transact(model_key, |s| s.heartbeat(instance, in_flight, now)).await
    }

    async fn reclaim_expired(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        lease: Duration,
        now: u64,
    ) -> Result<ReclaimReport, StoreError> {
        self.transact(model_key, |s| s.reclaim_expired(policy, lease, now)).await
    }

    async fn stats(&self, model_key: &str) -> Result<QueueStats, StoreError> {
        let state = self.backend.get_state(&self.key(model_key)).await?;
        Ok(state.map(|v| v.state.stats()).unwrap_or_default())
    }
}

/// Versioned in-memory backend. Clones share data.
#[derive(Default, Clone, Debug)]
pub struct InMemoryStateBackend {
    data: Arc<Mutex<HashMap<String, Versioned>>>,
}

impl InMemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn get_state(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.get(key).cloned())
    }

    async fn set_state(
        &self,
        key: &str,
        state: &ModelState,
        prev_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let current = guard.get(key).map(|v| v.version);
        if current != prev_version {
            return Ok(false);
        }
        let version = prev_version.map_or(1, |v| v + 1);
        guard.insert(key.to_string(), Versioned { version, state: state.clone() });
        Ok(true)
    }
}
