//! Admission gate: one background loop per queue instance.
//!
//! Each tick heartbeats, reclaims expired claims, then admits head-of-line requests until the
//! head blocks. Between ticks the loop sleeps until woken (enqueue, settlement, cancellation,
//! configuration change) or until the blocking condition should have cleared, capped by the
//! poll interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::budget::BudgetUpdate;
use crate::dispatcher;
use crate::error::StoreError;
use crate::instance::{DispatchJob, LocalEntry, LocalState, Shared};
use crate::model::LanguageModel;
use crate::request::{RequestRecord, RequestStatus};
use crate::store::{ClaimOutcome, ClaimRequest};
use crate::telemetry::QueueEvent;

const MIN_WAIT: Duration = Duration::from_millis(1);

pub(crate) async fn run<M: LanguageModel>(shared: Arc<Shared<M>>) {
    let mut dispatches = JoinSet::new();
    let mut failures = 0usize;
    info!(target: "lmqueue::gate", model_key = %shared.model_key(), instance = %shared.instance(), "gate started");

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        let wait = match tick(&shared, &mut dispatches).await {
            Ok(wait) => {
                failures = 0;
                wait
            }
            Err(err) => {
                failures += 1;
                let delay = shared
                    .config
                    .store_jitter()
                    .apply(shared.config.store_backoff().delay(failures))
                    .max(MIN_WAIT);
                warn!(target: "lmqueue::gate", model_key = %shared.model_key(), error = %err, failures, delay_ms = delay.as_millis() as u64, "store failure; backing off");
                delay
            }
        };

        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = shared.wake.notified() => {}
            Some(joined) = dispatches.join_next(), if !dispatches.is_empty() => {
                if let Err(err) = joined {
                    warn!(target: "lmqueue::gate", error = %err, "dispatcher task failed");
                }
            }
            _ = shared.config.sleeper().sleep(wait) => {}
        }
    }

    // In-flight calls observe the same shutdown through their request tokens.
    while dispatches.join_next().await.is_some() {}
    // Nothing here will dispatch our records again, and no other instance may.
    let aborted = shared.abort_waiting().await;
    info!(target: "lmqueue::gate", model_key = %shared.model_key(), instance = %shared.instance(), aborted, "gate stopped");
}

/// One admission pass. Returns how long to wait before the next one.
async fn tick<M: LanguageModel>(
    shared: &Arc<Shared<M>>,
    dispatches: &mut JoinSet<()>,
) -> Result<Duration, StoreError> {
    let model_key = shared.model_key();
    let poll = shared.config.poll_interval();

    let in_flight = shared.in_flight_ids();
    shared.store.heartbeat(model_key, shared.instance(), &in_flight, shared.now()).await?;

    let report = shared
        .store
        .reclaim_expired(model_key, &shared.policy, shared.config.lease_duration(), shared.now())
        .await?;
    if !report.is_empty() {
        warn!(target: "lmqueue::gate", model_key = %model_key, reclaimed = report.reclaimed.len(), pruned = report.pruned.len(), "reclaimed abandoned requests");
        shared
            .sink
            .emit(QueueEvent::Reclaimed {
                model_key: model_key.to_string(),
                reclaimed: report.reclaimed.len(),
                pruned: report.pruned.len(),
            })
            .await;
    }

    loop {
        if shared.shutdown.is_cancelled() {
            return Ok(poll);
        }
        let claim = ClaimRequest {
            instance: shared.instance().clone(),
            policy: shared.policy,
            max_concurrent: shared.max_concurrent.load(),
        };
        match shared.store.try_claim_head(model_key, &claim, shared.now()).await? {
            ClaimOutcome::Claimed(record) => start(shared, record, dispatches).await?,
            ClaimOutcome::Blocked { head, reason, retry_in } => {
                debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %head, reason = %reason, "head of queue blocked");
                return Ok(retry_in.map_or(poll, |d| d.clamp(MIN_WAIT, poll)));
            }
            ClaimOutcome::HeadOwnedElsewhere { head, origin } => {
                debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %head, origin = %origin, "head of queue belongs to another instance");
                return Ok(poll);
            }
            ClaimOutcome::Empty => {
                restore_lost(shared).await?;
                return Ok(poll);
            }
        }
    }
}

/// Hand a claimed record to a dispatcher, or undo the claim if there is nothing to run.
async fn start<M: LanguageModel>(
    shared: &Arc<Shared<M>>,
    mut record: RequestRecord,
    dispatches: &mut JoinSet<()>,
) -> Result<(), StoreError> {
    enum Next<M: LanguageModel> {
        Dispatch(DispatchJob<M::Payload>),
        Duplicate,
        Cancelled(LocalEntry<M>),
        Missing,
    }

    let next: Next<M> = {
        let mut local = shared.local();
        match local.get(&record.id).map(|e| (e.state, e.is_cancelled())) {
            None => Next::Missing,
            Some((LocalState::InFlight, _)) => Next::Duplicate,
            Some((_, true)) => local.remove(&record.id).map_or(Next::Missing, Next::Cancelled),
            Some(_) => match local.get_mut(&record.id) {
                Some(entry) => {
                    entry.state = LocalState::InFlight;
                    // The store copy lags when a requeue failed and the lease expired.
                    record.rate_limit_retries =
                        record.rate_limit_retries.max(entry.record.rate_limit_retries);
                    Next::Dispatch(DispatchJob {
                        method: entry.record.method,
                        payload: entry.payload.clone(),
                        cancel: entry.cancel.clone(),
                        caller: entry.caller.clone(),
                    })
                }
                None => Next::Missing,
            },
        }
    };

    let model_key = shared.model_key();
    match next {
        Next::Dispatch(job) => {
            let waited = Duration::from_millis(shared.now().saturating_sub(record.queued_at));
            debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %record.id, token_count = record.token_count, "request admitted");
            shared
                .sink
                .emit(QueueEvent::Dispatched {
                    request_id: record.id,
                    model_key: model_key.to_string(),
                    token_count: record.token_count,
                    waited,
                })
                .await;
            dispatches.spawn(dispatcher::run(shared.clone(), record, job));
        }
        Next::Duplicate => {
            // Our call is still running after another instance reclaimed it; keep the
            // record claimed by us and give back the second spend.
            debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %record.id, "reclaimed request is still in flight here");
            shared
                .store
                .update_budget(
                    model_key,
                    &BudgetUpdate::Refund { tokens: record.token_count },
                    &shared.policy,
                    shared.now(),
                )
                .await?;
        }
        Next::Cancelled(entry) => {
            debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %record.id, "claimed request was cancelled; releasing");
            shared.discard(entry).await;
        }
        Next::Missing => {
            debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %record.id, "claimed request has no local entry; releasing");
            shared.store.release(model_key, record.id, &shared.policy, shared.now()).await?;
        }
    }
    Ok(())
}

/// Re-enqueue waiting requests whose records vanished from the store, e.g. pruned by another
/// instance while this one was stalled. Enqueue is idempotent per request id.
async fn restore_lost<M: LanguageModel>(shared: &Arc<Shared<M>>) -> Result<(), StoreError> {
    let mut waiting: Vec<RequestRecord> = shared
        .local()
        .values()
        .filter(|e| e.state == LocalState::Waiting && e.enqueued)
        .map(|e| e.record.clone())
        .collect();
    if waiting.is_empty() {
        return Ok(());
    }
    waiting.sort_by_key(|r| r.queued_at);
    warn!(target: "lmqueue::gate", model_key = %shared.model_key(), count = waiting.len(), "restoring requests missing from the store");
    for mut record in waiting {
        record.status = RequestStatus::Pending;
        shared.store.enqueue(record, shared.now()).await?;
    }
    shared.wake.notify_one();
    Ok(())
}
