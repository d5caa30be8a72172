//! State of one queue instance, shared by its facade, gate loop, dispatchers and
//! cancellation watchers.
//!
//! The store holds what every instance must agree on. This module holds what only the
//! origin instance can have: payloads, reply channels and cancellation tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adaptive::DynamicConfig;
use crate::budget::BudgetPolicy;
use crate::config::{ModelLimits, QueueConfig};
use crate::error::QueueError;
use crate::model::LanguageModel;
use crate::request::{InstanceId, Method, RequestId, RequestRecord, RequestStatus};
use crate::store::QueueStore;
use crate::telemetry::{EventSink, QueueEvent};

pub(crate) type Reply<M> =
    oneshot::Sender<Result<<M as LanguageModel>::Response, QueueError<<M as LanguageModel>::Error>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalState {
    /// Queued; the record is `Pending` in the store (or being enqueued).
    Waiting,
    /// A dispatcher owns the call.
    InFlight,
    /// Rate-limited; the record is on its way back to the head of the queue.
    Requeueing,
}

pub(crate) struct LocalEntry<M: LanguageModel> {
    pub(crate) record: RequestRecord,
    pub(crate) payload: Arc<M::Payload>,
    pub(crate) cancel: CancellationToken,
    /// The caller's token. Its watcher forwards it to `cancel`, but not synchronously.
    pub(crate) caller: Option<CancellationToken>,
    pub(crate) reply: Reply<M>,
    pub(crate) state: LocalState,
    /// Set once the store accepted the record.
    pub(crate) enqueued: bool,
}

impl<M: LanguageModel> LocalEntry<M> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.caller.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// What a dispatcher needs to run one call.
pub(crate) struct DispatchJob<P> {
    pub(crate) method: Method,
    pub(crate) payload: Arc<P>,
    pub(crate) cancel: CancellationToken,
    pub(crate) caller: Option<CancellationToken>,
}

impl<P> DispatchJob<P> {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.caller.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolves when either the request token or the caller's token fires. The request
    /// token is cancelled before this returns, so the provider sees it too.
    pub(crate) async fn cancelled(&self) {
        match &self.caller {
            Some(caller) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = caller.cancelled() => self.cancel.cancel(),
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

pub(crate) struct Shared<M: LanguageModel> {
    pub(crate) model: Arc<M>,
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) limits: ModelLimits,
    pub(crate) policy: BudgetPolicy,
    pub(crate) config: QueueConfig,
    pub(crate) max_concurrent: DynamicConfig<usize>,
    pub(crate) local: Mutex<HashMap<RequestId, LocalEntry<M>>>,
    pub(crate) wake: Notify,
    pub(crate) shutdown: CancellationToken,
    pub(crate) sink: EventSink,
}

impl<M: LanguageModel> Shared<M> {
    pub(crate) fn now(&self) -> u64 {
        self.config.clock().now_millis()
    }

    pub(crate) fn model_key(&self) -> &str {
        self.limits.model_key()
    }

    pub(crate) fn instance(&self) -> &InstanceId {
        self.config.instance_id()
    }

    pub(crate) fn local(&self) -> MutexGuard<'_, HashMap<RequestId, LocalEntry<M>>> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn in_flight_ids(&self) -> Vec<RequestId> {
        self.local()
            .iter()
            .filter(|(_, e)| e.state == LocalState::InFlight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// `(waiting, in_flight)` counts for this instance.
    pub(crate) fn local_counts(&self) -> (usize, usize) {
        let local = self.local();
        let in_flight = local.values().filter(|e| e.state == LocalState::InFlight).count();
        (local.len() - in_flight, in_flight)
    }

    /// Deliver a terminal result to the caller and forget the request locally.
    pub(crate) async fn settle(
        &self,
        id: RequestId,
        status: RequestStatus,
        result: Result<M::Response, QueueError<M::Error>>,
    ) {
        let entry = self.local().remove(&id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let elapsed = Duration::from_millis(self.now().saturating_sub(entry.record.queued_at));
            if entry.reply.send(result).is_err() {
                debug!(target: "lmqueue::dispatcher", request_id = %id, "caller dropped the response handle");
            }
            self.sink
                .emit(QueueEvent::Settled {
                    request_id: id,
                    model_key: self.model_key().to_string(),
                    status,
                    elapsed,
                })
                .await;
        }
        self.wake.notify_one();
    }

    /// Caller cancellation. Waiting requests leave the queue now; in-flight ones are
    /// unwound by their dispatcher, which observes the same token.
    pub(crate) async fn on_cancel(&self, id: RequestId) {
        let waiting = {
            let mut local = self.local();
            match local.get(&id) {
                Some(entry) if entry.state == LocalState::Waiting => local.remove(&id),
                _ => None,
            }
        };
        let Some(entry) = waiting else {
            return;
        };

        debug!(target: "lmqueue::gate", request_id = %id, model_key = %self.model_key(), "pending request cancelled");
        self.discard(entry).await;
        self.wake.notify_one();
    }

    /// Fail every request still waiting locally. Run by the gate once it stopped.
    pub(crate) async fn abort_waiting(&self) -> usize {
        let drained: Vec<LocalEntry<M>> = {
            let mut local = self.local();
            let ids: Vec<RequestId> = local
                .iter()
                .filter(|(_, e)| e.state != LocalState::InFlight)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| local.remove(&id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            self.discard(entry).await;
        }
        count
    }

    /// Release an entry's record that never reached the provider and fail its caller with
    /// `Aborted`. The entry must already be out of the local map.
    pub(crate) async fn discard(&self, entry: LocalEntry<M>) {
        let id = entry.record.id;
        entry.cancel.cancel();
        if let Err(err) = self.store.release(self.model_key(), id, &self.policy, self.now()).await {
            warn!(target: "lmqueue::store", request_id = %id, error = %err, "failed to remove aborted request; lease reclamation will clean it up");
        }
        let _ = entry.reply.send(Err(QueueError::Aborted { request_id: id }));
        self.sink
            .emit(QueueEvent::Settled {
                request_id: id,
                model_key: self.model_key().to_string(),
                status: RequestStatus::Aborted,
                elapsed: Duration::from_millis(self.now().saturating_sub(entry.record.queued_at)),
            })
            .await;
    }
}
