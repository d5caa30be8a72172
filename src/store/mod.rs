//! Shared request store.
//!
//! A [`QueueStore`] holds, per model key, the FIFO order of request records, the token budget
//! and instance heartbeats. Every method is one atomic transition, so cooperating queue
//! instances (in one process or many) never claim the same request or double-spend budget.
//!
//! Implementations:
//! - [`InMemoryQueueStore`]: mutex-protected map; instances sharing one `Arc` cooperate.
//! - [`CasQueueStore`]: optimistic compare-and-set over any [`StateBackend`] (e.g. Redis).

mod cas;
mod memory;
mod state;

use std::time::Duration;

use async_trait::async_trait;

use crate::admission::BlockReason;
use crate::budget::{BudgetPolicy, BudgetUpdate, TokenBudget};
use crate::error::StoreError;
use crate::request::{InstanceId, RequestId, RequestRecord};

pub use cas::{CasQueueStore, InMemoryStateBackend, StateBackend, Versioned, DEFAULT_CAS_ATTEMPTS};
pub use memory::InMemoryQueueStore;
pub use state::ModelState;

/// Parameters of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    /// Only records this instance enqueued are claimed.
    pub instance: InstanceId,
    pub policy: BudgetPolicy,
    pub max_concurrent: usize,
}

/// Result of [`QueueStore::try_claim_head`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The head was admitted: it is now `Processing` and its tokens are spent.
    Claimed(RequestRecord),
    /// The head cannot be admitted yet; nothing behind it may be either.
    Blocked { head: RequestId, reason: BlockReason, retry_in: Option<Duration> },
    /// The head belongs to another instance, which will dispatch it.
    HeadOwnedElsewhere { head: RequestId, origin: InstanceId },
    /// No `Pending` records.
    Empty,
}

/// What [`QueueStore::reclaim_expired`] changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    /// Claims whose lease expired; reset to `Pending` with tokens refunded.
    pub reclaimed: Vec<RequestId>,
    /// `Pending` records dropped because their origin stopped heartbeating.
    pub pruned: Vec<RequestRecord>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.pruned.is_empty()
    }
}

/// Record counts for one model key, across all instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
}

/// Shared store contract. All timestamps are milliseconds from the queue clock.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Append a `Pending` record to the tail of its model's FIFO order.
    async fn enqueue(&self, record: RequestRecord, now: u64) -> Result<(), StoreError>;

    /// Atomically admit the head-of-line `Pending` record: check concurrency and budget,
    /// decrement the budget, mark the record `Processing`.
    async fn try_claim_head(
        &self,
        model_key: &str,
        claim: &ClaimRequest,
        now: u64,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Remove a record in any status (settled, or cancelled while pending).
    async fn remove(&self, model_key: &str, id: RequestId)
        -> Result<Option<RequestRecord>, StoreError>;

    /// Remove a record and refund its tokens if it was `Processing`.
    async fn release(
        &self,
        model_key: &str,
        id: RequestId,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Return a `Processing` record to `Pending` at the head and count the retry.
    async fn requeue_front(&self, model_key: &str, id: RequestId) -> Result<bool, StoreError>;

    /// Budget projected to `now`.
    async fn budget(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError>;

    /// Apply a delta or authoritative snapshot; returns the resulting budget.
    async fn update_budget(
        &self,
        model_key: &str,
        update: &BudgetUpdate,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError>;

    /// Record `instance` as alive and renew leases of the listed in-flight records.
    async fn heartbeat(
        &self,
        model_key: &str,
        instance: &InstanceId,
        in_flight: &[RequestId],
        now: u64,
    ) -> Result<(), StoreError>;

    /// Reclaim expired claims and prune orphaned `Pending` records.
    async fn reclaim_expired(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        lease: Duration,
        now: u64,
    ) -> Result<ReclaimReport, StoreError>;

    async fn stats(&self, model_key: &str) -> Result<QueueStats, StoreError>;
}
