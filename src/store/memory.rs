use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ClaimOutcome, ClaimRequest, ModelState, QueueStats, QueueStore, ReclaimReport};
use crate::budget::{BudgetPolicy, BudgetUpdate, TokenBudget};
use crate::error::StoreError;
use crate::request::{InstanceId, RequestId, RequestRecord};

/// In-process store. Clones share state.
#[derive(Default, Clone, Debug)]
pub struct InMemoryQueueStore {
    models: Arc<Mutex<HashMap<String, ModelState>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ModelState>> {
        // Transitions never panic midway, so a poisoned map is still consistent.
        self.models.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_model<T>(&self, model_key: &str, f: impl FnOnce(&mut ModelState) -> T) -> T {
        let mut models = self.lock();
        let state = models.entry(model_key.to_string()).or_default();
        f(state)
    }

    /// Copy of the shared state for `model_key`.
    pub fn snapshot(&self, model_key: &str) -> Option<ModelState> {
        self.lock().get(model_key).cloned()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, record: RequestRecord, now: u64) -> Result<(), StoreError> {
        let key = record.model_key.clone();
        self.with_model(&key, |s| s.enqueue(record, now));
        Ok(())
    }

    async fn try_claim_head(
        &self,
        model_key: &str,
        claim: &ClaimRequest,
        now: u64,
    ) -> Result<ClaimOutcome, StoreError> {
        Ok(self.with_model(model_key, |s| s.try_claim_head(claim, now)))
    }

    async fn remove(
        &self,
        model_key: &str,
        id: RequestId,
    ) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.with_model(model_key, |s| s.remove(id)))
    }

    async fn release(
        &self,
        model_key: &str,
        id: RequestId,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.with_model(model_key, |s| s.release(id, policy, now)))
    }

    async fn requeue_front(&self, model_key: &str, id: RequestId) -> Result<bool, StoreError> {
        Ok(self.with_model(model_key, |s| s.requeue_front(id)))
    }

    async fn budget(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError> {
        Ok(self.with_model(model_key, |s| s.projected_budget(policy, now)))
    }

    async fn update_budget(
        &self,
        model_key: &str,
        update: &BudgetUpdate,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError> {
        Ok(self.with_model(model_key, |s| s.update_budget(update, policy, now)))
    }

    async fn heartbeat(
        &self,
        model_key: &str,
        instance: &InstanceId,
        in_flight: &[RequestId],
        now: u64,
    ) -> Result<(), StoreError> {
        self.with_model(model_key, |s| s.heartbeat(instance, in_flight, now));
        Ok(())
    }

    async fn reclaim_expired(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        lease: Duration,
        now: u64,
    ) -> Result<ReclaimReport, StoreError> {
        Ok(self.with_model(model_key, |s| s.reclaim_expired(policy, lease, now)))
    }

    async fn stats(&self, model_key: &str) -> Result<QueueStats, StoreError> {
        Ok(self.lock().get(model_key).map(ModelState::stats).unwrap_or_default())
    }
}
