//! Per-model shared state and the transitions every store applies atomically.
//!
//! Stores differ only in how they make a transition atomic (a mutex, or a compare-and-set
//! loop over a versioned backend); the transitions themselves live here so all stores agree.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::admission::{self, Admission};
use crate::budget::{millis, BudgetPolicy, BudgetUpdate, TokenBudget};
use crate::request::{InstanceId, RequestId, RequestRecord, RequestStatus};

use super::{ClaimOutcome, ClaimRequest, QueueStats, ReclaimReport};

/// Everything cooperating instances share for one model key.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelState {
    /// FIFO order. `Processing` records keep their position so a reclaimed record returns to
    /// where it was.
    pub records: VecDeque<RequestRecord>,
    /// `None` until the first mutation; reads treat it as a full budget.
    pub budget: Option<TokenBudget>,
    /// Last heartbeat per instance.
    pub heartbeats: BTreeMap<InstanceId, u64>,
}

impl ModelState {
    fn budget_mut(&mut self, policy: &BudgetPolicy, now: u64) -> &mut TokenBudget {
        self.budget.get_or_insert_with(|| TokenBudget::full(policy, now))
    }

    fn position(&self, id: RequestId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// Budget as it stands at `now`.
    pub fn projected_budget(&self, policy: &BudgetPolicy, now: u64) -> TokenBudget {
        match &self.budget {
            Some(budget) => budget.project(policy, now),
            None => TokenBudget::full(policy, now),
        }
    }

    /// Append a `Pending` record and mark its origin alive. A record whose id is already
    /// present is ignored.
    pub fn enqueue(&mut self, record: RequestRecord, now: u64) {
        self.heartbeats.insert(record.origin.clone(), now);
        if self.position(record.id).is_none() {
            self.records.push_back(record);
        }
    }

    /// Dispatch the head-of-line `Pending` record if admission allows it.
    ///
    /// Decrementing the budget and marking the record `Processing` happen in one transition.
    pub fn try_claim_head(&mut self, claim: &ClaimRequest, now: u64) -> ClaimOutcome {
        let Some(index) = self.records.iter().position(RequestRecord::is_pending) else {
            return ClaimOutcome::Empty;
        };
        let head = &self.records[index];
        if head.origin != claim.instance {
            return ClaimOutcome::HeadOwnedElsewhere { head: head.id, origin: head.origin.clone() };
        }

        let processing = self.processing_count();
        let projected = self.projected_budget(&claim.policy, now);
        match admission::evaluate(
            head.token_count,
            processing,
            claim.max_concurrent,
            &projected,
            &claim.policy,
            now,
        ) {
            Admission::Blocked { reason, retry_in } => {
                ClaimOutcome::Blocked { head: head.id, reason, retry_in }
            }
            Admission::Admit => {
                let mut budget = projected;
                budget.consume(head.token_count, true);
                self.budget = Some(budget);

                let record = &mut self.records[index];
                record.status = RequestStatus::Processing;
                record.processing_started_at = Some(now);
                record.lease_renewed_at = Some(now);
                record.claimed_by = Some(claim.instance.clone());
                ClaimOutcome::Claimed(record.clone())
            }
        }
    }

    /// Remove a record regardless of status.
    pub fn remove(&mut self, id: RequestId) -> Option<RequestRecord> {
        self.position(id).and_then(|i| self.records.remove(i))
    }

    /// Remove a record; if it was `Processing`, refund its tokens. Used for work that never
    /// reached the provider.
    pub fn release(&mut self, id: RequestId, policy: &BudgetPolicy, now: u64) -> Option<RequestRecord> {
        let record = self.remove(id)?;
        if record.is_processing() {
            self.refund(record.token_count, policy, now);
        }
        Some(record)
    }

    fn refund(&mut self, tokens: u64, policy: &BudgetPolicy, now: u64) {
        let budget = self.budget_mut(policy, now);
        *budget = budget.apply(&BudgetUpdate::Refund { tokens }, policy, now);
    }

    /// Return a `Processing` record to `Pending` at the head of the queue and count the retry.
    pub fn requeue_front(&mut self, id: RequestId) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        if !self.records[index].is_processing() {
            return false;
        }
        let Some(mut record) = self.records.remove(index) else {
            return false;
        };
        reset_to_pending(&mut record);
        record.rate_limit_retries = record.rate_limit_retries.saturating_add(1);
        self.records.push_front(record);
        true
    }

    pub fn update_budget(&mut self, update: &BudgetUpdate, policy: &BudgetPolicy, now: u64) -> TokenBudget {
        let budget = self.budget_mut(policy, now);
        *budget = budget.apply(update, policy, now);
        *budget
    }

    /// Mark `instance` alive and renew the lease of the listed records it holds.
    pub fn heartbeat(&mut self, instance: &InstanceId, in_flight: &[RequestId], now: u64) {
        self.heartbeats.insert(instance.clone(), now);
        for record in self.records.iter_mut() {
            if record.is_processing()
                && record.claimed_by.as_ref() == Some(instance)
                && in_flight.contains(&record.id)
            {
                record.lease_renewed_at = Some(now);
            }
        }
    }

    /// Reset expired claims to `Pending` in place (refunding them), then prune `Pending`
    /// records whose origin stopped heartbeating.
    pub fn reclaim_expired(&mut self, policy: &BudgetPolicy, lease: Duration, now: u64) -> ReclaimReport {
        let lease_ms = millis(lease);
        let mut report = ReclaimReport::default();

        let mut refunds = Vec::new();
        for record in self.records.iter_mut() {
            if record.lease_expires_at(lease_ms).is_some_and(|expires| expires <= now) {
                refunds.push(record.token_count);
                report.reclaimed.push(record.id);
                reset_to_pending(record);
            }
        }
        for tokens in refunds {
            self.refund(tokens, policy, now);
        }

        let alive = |origin: &InstanceId, heartbeats: &BTreeMap<InstanceId, u64>| {
            heartbeats
                .get(origin)
                .is_some_and(|last| now.saturating_sub(*last) < lease_ms)
        };
        let heartbeats = &self.heartbeats;
        let (keep, pruned): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| !r.is_pending() || alive(&r.origin, heartbeats));
        self.records = keep;
        report.pruned = pruned.into_iter().collect();

        // Forget dead instances that no longer own anything.
        let records = &self.records;
        self.heartbeats.retain(|instance, last| {
            now.saturating_sub(*last) < lease_ms || records.iter().any(|r| &r.origin == instance)
        });

        report
    }

    pub fn processing_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_processing()).count()
    }

    pub fn stats(&self) -> QueueStats {
        let processing = self.processing_count();
        QueueStats { pending: self.records.len() - processing, processing }
    }
}

fn reset_to_pending(record: &mut RequestRecord) {
    record.status = RequestStatus::Pending;
    record.claimed_by = None;
    record.processing_started_at = None;
    record.lease_renewed_at = None;
}
