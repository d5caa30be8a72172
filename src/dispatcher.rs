//! Runs one claimed request against the provider and settles it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::budget::{BudgetUpdate, RateLimitSnapshot};
use crate::error::QueueError;
use crate::instance::{DispatchJob, LocalState, Shared};
use crate::model::{FailureKind, LanguageModel};
use crate::request::{RequestRecord, RequestStatus};
use crate::telemetry::QueueEvent;

pub(crate) async fn run<M: LanguageModel>(
    shared: Arc<Shared<M>>,
    record: RequestRecord,
    job: DispatchJob<M::Payload>,
) {
    let id = record.id;
    let outcome = tokio::select! {
        biased;
        _ = job.cancelled() => None,
        result = shared.model.call(job.method, &job.payload, job.cancel.clone()) => Some(result),
    };

    match outcome {
        None => {
            debug!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, "in-flight request cancelled");
            remove_record(&shared, &record).await;
            shared.settle(id, RequestStatus::Aborted, Err(QueueError::Aborted { request_id: id })).await;
        }
        Some(Ok(response)) => {
            if let Some(snapshot) = shared.model.response_telemetry(&response) {
                recalibrate(&shared, snapshot).await;
            }
            remove_record(&shared, &record).await;
            debug!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, "request delivered");
            shared.settle(id, RequestStatus::Delivered, Ok(response)).await;
        }
        Some(Err(error)) => match shared.model.classify_error(&error) {
            FailureKind::RateLimited { retry_after } => {
                let retry_after = retry_after.unwrap_or(shared.config.default_retry_after());
                rate_limited(&shared, &record, &job, error, retry_after).await;
            }
            FailureKind::Other => {
                debug!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, "provider call failed");
                remove_record(&shared, &record).await;
                shared.settle(id, RequestStatus::Failed, Err(QueueError::Provider(error))).await;
            }
        },
    }
}

/// Apply provider telemetry to the shared budget.
pub(crate) async fn recalibrate<M: LanguageModel>(shared: &Shared<M>, snapshot: RateLimitSnapshot) {
    let now = shared.now();
    match shared
        .store
        .update_budget(shared.model_key(), &BudgetUpdate::Snapshot(snapshot), &shared.policy, now)
        .await
    {
        Ok(budget) => {
            shared
                .sink
                .emit(QueueEvent::BudgetRecalibrated {
                    model_key: shared.model_key().to_string(),
                    available_tokens: budget.tokens(),
                    reset_in: budget.reset_at.map(|at| Duration::from_millis(at.saturating_sub(now))),
                })
                .await;
            shared.wake.notify_one();
        }
        Err(err) => {
            warn!(target: "lmqueue::store", model_key = %shared.model_key(), error = %err, "failed to apply rate-limit telemetry");
        }
    }
}

async fn rate_limited<M: LanguageModel>(
    shared: &Arc<Shared<M>>,
    record: &RequestRecord,
    job: &DispatchJob<M::Payload>,
    error: M::Error,
    retry_after: Duration,
) {
    let id = record.id;
    let now = shared.now();
    if let Err(err) = shared
        .store
        .update_budget(shared.model_key(), &BudgetUpdate::RateLimited { retry_after }, &shared.policy, now)
        .await
    {
        warn!(target: "lmqueue::store", model_key = %shared.model_key(), error = %err, "failed to zero the budget after a rate limit");
    }

    let cancelled = job.is_cancelled();
    let requeue = record.rate_limit_retries == 0 && !cancelled;
    shared
        .sink
        .emit(QueueEvent::RateLimited {
            request_id: id,
            model_key: shared.model_key().to_string(),
            retry_after,
            requeued: requeue,
        })
        .await;

    if cancelled {
        debug!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, "rate limited after cancellation");
        remove_record(shared, record).await;
        shared.settle(id, RequestStatus::Aborted, Err(QueueError::Aborted { request_id: id })).await;
        return;
    }
    if !requeue {
        info!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, "rate limited again; surfacing provider error");
        remove_record(shared, record).await;
        shared.settle(id, RequestStatus::Failed, Err(QueueError::Provider(error))).await;
        return;
    }

    info!(target: "lmqueue::dispatcher", request_id = %id, model_key = %record.model_key, retry_after_ms = retry_after.as_millis() as u64, "rate limited; returning request to the head of the queue");
    if let Some(entry) = shared.local().get_mut(&id) {
        entry.record.rate_limit_retries = entry.record.rate_limit_retries.saturating_add(1);
    }
    set_state(shared, record, LocalState::InFlight, LocalState::Requeueing);
    match shared.store.requeue_front(shared.model_key(), id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(target: "lmqueue::store", request_id = %id, "record was no longer processing; leaving it to reclamation")
        }
        Err(err) => {
            warn!(target: "lmqueue::store", request_id = %id, error = %err, "failed to requeue; the lease will expire and reclaim it")
        }
    }
    set_state(shared, record, LocalState::Requeueing, LocalState::Waiting);

    if job.is_cancelled() {
        shared.on_cancel(id).await;
    }
    shared.wake.notify_one();
}

fn set_state<M: LanguageModel>(
    shared: &Shared<M>,
    record: &RequestRecord,
    from: LocalState,
    to: LocalState,
) {
    if let Some(entry) = shared.local().get_mut(&record.id) {
        if entry.state == from {
            entry.state = to;
        }
    }
}

async fn remove_record<M: LanguageModel>(shared: &Shared<M>, record: &RequestRecord) {
    if let Err(err) = shared.store.remove(&record.model_key, record.id).await {
        warn!(target: "lmqueue::store", request_id = %record.id, error = %err, "failed to remove settled request; lease reclamation will clean it up");
    }
}
