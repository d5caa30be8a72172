//! The queue facade: one instance per model key per process.
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use lmqueue::{LanguageModel, LanguageModelQueue, Method, ModelLimits};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Echo;
//!
//! #[async_trait]
//! impl LanguageModel for Echo {
//!     type Payload = String;
//!     type Response = String;
//!     type Error = std::io::Error;
//!
//!     async fn call(&self, _m: Method, p: &String, _c: CancellationToken) -> Result<String, std::io::Error> {
//!         Ok(p.to_uppercase())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limits = ModelLimits::new("echo", 4_096, 90_000).unwrap();
//! let queue = LanguageModelQueue::new(Echo, limits, |p: &String| p.len() as u64, 2).unwrap();
//! let out = queue.generate_text("hello".to_string(), None).await.unwrap();
//! assert_eq!(out, "HELLO");
//! queue.dispose().await;
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adaptive::DynamicConfig;
use crate::budget::{RateLimitSnapshot, TokenBudget};
use crate::config::{ModelLimits, QueueConfig};
use crate::dispatcher;
use crate::error::{ConfigError, QueueError, StoreError};
use crate::gate;
use crate::instance::{LocalEntry, LocalState, Shared};
use crate::model::{LanguageModel, TokenEstimator};
use crate::request::{InstanceId, Method, RequestId, RequestRecord};
use crate::store::{InMemoryQueueStore, QueueStore};
use crate::telemetry::{EventSink, QueueEvent, TelemetrySink};

/// Point-in-time view of one model key.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueMetrics {
    /// `Processing` records across all instances.
    pub active_requests: usize,
    /// `Pending` records across all instances.
    pub queue_size: usize,
    pub available_tokens: u64,
    pub queue_instance_id: InstanceId,
    pub model_key: String,
    /// Requests this instance holds that have not been dispatched.
    pub local_pending: usize,
    pub local_in_flight: usize,
}

/// Awaitable result of [`LanguageModelQueue::submit`].
///
/// The id is known before the request settles. Dropping the handle does not cancel the
/// request; use the cancellation token for that.
#[pin_project]
#[derive(Debug)]
pub struct QueuedResponse<T, E> {
    request_id: RequestId,
    #[pin]
    rx: oneshot::Receiver<Result<T, QueueError<E>>>,
}

impl<T, E> QueuedResponse<T, E> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl<T, E> Future for QueuedResponse<T, E> {
    type Output = Result<T, QueueError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.rx.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The queue went away without settling.
            Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Aborted { request_id: *this.request_id })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Rate-aware FIFO queue in front of one model.
pub struct LanguageModelQueue<M: LanguageModel> {
    shared: Arc<Shared<M>>,
    estimator: Arc<dyn TokenEstimator<M::Payload>>,
    gate: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<M: LanguageModel> std::fmt::Debug for LanguageModelQueue<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelQueue")
            .field("model_key", &self.model_key())
            .field("instance_id", self.instance_id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<M: LanguageModel> LanguageModelQueue<M> {
    pub fn builder(model: impl Into<Arc<M>>, limits: ModelLimits) -> LanguageModelQueueBuilder<M> {
        LanguageModelQueueBuilder {
            model: model.into(),
            limits,
            estimator: None,
            config: QueueConfig::default(),
            store: None,
            sink: EventSink::default(),
        }
    }

    /// In-process queue with default settings. Must be called inside a Tokio runtime.
    pub fn new<E>(
        model: impl Into<Arc<M>>,
        limits: ModelLimits,
        estimator: E,
        max_concurrent_requests: usize,
    ) -> Result<Self, ConfigError>
    where
        E: TokenEstimator<M::Payload> + 'static,
    {
        let config = QueueConfig::builder().max_concurrent_requests(max_concurrent_requests).build()?;
        Self::builder(model, limits).estimator(estimator).config(config).build()
    }

    pub fn model_key(&self) -> &str {
        self.shared.model_key()
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.shared.instance()
    }

    pub fn limits(&self) -> &ModelLimits {
        &self.shared.limits
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub async fn generate_text(
        &self,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<M::Response, QueueError<M::Error>> {
        self.submit(Method::GenerateText, payload, cancel).await?.await
    }

    pub async fn generate_object(
        &self,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<M::Response, QueueError<M::Error>> {
        self.submit(Method::GenerateObject, payload, cancel).await?.await
    }

    /// Settles once the provider has returned its stream handle.
    pub async fn stream_text(
        &self,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<M::Response, QueueError<M::Error>> {
        self.submit(Method::StreamText, payload, cancel).await?.await
    }

    pub async fn stream_object(
        &self,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<M::Response, QueueError<M::Error>> {
        self.submit(Method::StreamObject, payload, cancel).await?.await
    }

    /// Enqueue a request and return its awaitable.
    ///
    /// Fails without creating a record if the queue is disposed, the estimate exceeds the
    /// single-message ceiling, or the store rejects the enqueue.
    pub async fn submit(
        &self,
        method: Method,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<QueuedResponse<M::Response, M::Error>, QueueError<M::Error>> {
        self.enqueue(method, payload, None, cancel).await
    }

    /// Like [`submit`](Self::submit), tagging the record with the caller's identity.
    pub async fn submit_as(
        &self,
        requester_id: impl Into<String>,
        method: Method,
        payload: M::Payload,
        cancel: Option<CancellationToken>,
    ) -> Result<QueuedResponse<M::Response, M::Error>, QueueError<M::Error>> {
        self.enqueue(method, payload, Some(requester_id.into()), cancel).await
    }

    async fn enqueue(
        &self,
        method: Method,
        payload: M::Payload,
        requester_id: Option<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<QueuedResponse<M::Response, M::Error>, QueueError<M::Error>> {
        let shared = &self.shared;
        let model_key = shared.model_key();
        if self.is_disposed() {
            return Err(QueueError::Disposed { model_key: model_key.to_string() });
        }
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            debug!(target: "lmqueue::gate", model_key = %model_key, "token already cancelled; not enqueued");
            return Err(QueueError::Aborted { request_id: RequestId::new() });
        }

        let token_count = self.estimator.estimate(&payload);
        let max_tokens = shared.limits.max_tokens_per_message();
        if token_count > max_tokens {
            debug!(target: "lmqueue::gate", model_key = %model_key, token_count, max_tokens, "message too large; rejected");
            shared
                .sink
                .emit(QueueEvent::Rejected { model_key: model_key.to_string(), token_count, max_tokens })
                .await;
            return Err(QueueError::MessageTooLarge { token_count, max_tokens, model_key: model_key.to_string() });
        }

        let now = shared.now();
        let mut record = RequestRecord::pending(model_key, method, token_count, shared.instance().clone(), now);
        if let Some(requester_id) = requester_id {
            record = record.with_requester(requester_id);
        }
        let id = record.id;
        let request_token = shared.shutdown.child_token();
        let (reply, rx) = oneshot::channel();

        {
            let mut local = shared.local();
            // Checked under the lock so dispose either sees this entry or we see dispose.
            if shared.shutdown.is_cancelled() {
                return Err(QueueError::Disposed { model_key: model_key.to_string() });
            }
            local.insert(
                id,
                LocalEntry {
                    record: record.clone(),
                    payload: Arc::new(payload),
                    cancel: request_token.clone(),
                    caller: cancel.clone(),
                    reply,
                    state: LocalState::Waiting,
                    enqueued: false,
                },
            );
        }

        if let Err(err) = shared.store.enqueue(record, now).await {
            shared.local().remove(&id);
            warn!(target: "lmqueue::store", model_key = %model_key, error = %err, "enqueue failed");
            return Err(QueueError::Store(err));
        }

        let still_local = match shared.local().get_mut(&id) {
            Some(entry) => {
                entry.enqueued = true;
                true
            }
            None => false,
        };
        if !still_local {
            // Disposed while the store call was running; the caller already has `Aborted`.
            if let Err(err) = shared.store.release(model_key, id, &shared.policy, shared.now()).await {
                warn!(target: "lmqueue::store", request_id = %id, error = %err, "failed to remove request enqueued during dispose");
            }
            return Ok(QueuedResponse { request_id: id, rx });
        }

        if let Some(caller) = cancel {
            tokio::spawn(watch_cancellation(shared.clone(), id, caller, request_token));
        }

        debug!(target: "lmqueue::gate", model_key = %model_key, request_id = %id, token_count, method = %method, "request enqueued");
        shared
            .sink
            .emit(QueueEvent::Enqueued { request_id: id, model_key: model_key.to_string(), method, token_count })
            .await;
        shared.wake.notify_one();
        Ok(QueuedResponse { request_id: id, rx })
    }

    /// Snapshot of the shared queue and this instance's share of it.
    pub async fn metrics(&self) -> Result<QueueMetrics, StoreError> {
        let shared = &self.shared;
        let model_key = shared.model_key();
        let stats = shared.store.stats(model_key).await?;
        let budget = shared.store.budget(model_key, &shared.policy, shared.now()).await?;
        let (local_pending, local_in_flight) = shared.local_counts();
        Ok(QueueMetrics {
            active_requests: stats.processing,
            queue_size: stats.pending,
            available_tokens: budget.tokens(),
            queue_instance_id: shared.instance().clone(),
            model_key: model_key.to_string(),
            local_pending,
            local_in_flight,
        })
    }

    /// Shared budget projected to now.
    pub async fn budget(&self) -> Result<TokenBudget, StoreError> {
        let shared = &self.shared;
        shared.store.budget(shared.model_key(), &shared.policy, shared.now()).await
    }

    /// Apply provider telemetry observed outside the queue.
    pub async fn recalibrate(&self, snapshot: RateLimitSnapshot) {
        dispatcher::recalibrate(&self.shared, snapshot).await;
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.shared.max_concurrent.load()
    }

    /// Change the concurrency ceiling. Requests already in flight are not interrupted.
    pub fn set_max_concurrent_requests(&self, max: usize) -> Result<(), ConfigError> {
        if max == 0 {
            return Err(ConfigError::Zero { field: "max_concurrent_requests" });
        }
        self.shared.max_concurrent.set(max);
        info!(target: "lmqueue::gate", model_key = %self.model_key(), max_concurrent_requests = max, "concurrency limit changed");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop the gate and fail everything this instance still owns with `Aborted`.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = &self.shared;
        // Cancels the gate and, through child tokens, every in-flight call. The gate
        // releases waiting records on its way out.
        shared.shutdown.cancel();
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(gate) = gate {
            if let Err(err) = gate.await {
                warn!(target: "lmqueue::gate", model_key = %shared.model_key(), error = %err, "gate task failed");
                shared.abort_waiting().await;
            }
        }
        info!(target: "lmqueue::gate", model_key = %shared.model_key(), instance = %shared.instance(), "queue disposed");
    }
}

impl<M: LanguageModel> Drop for LanguageModelQueue<M> {
    /// The gate still releases this instance's records, without being awaited.
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn watch_cancellation<M: LanguageModel>(
    shared: Arc<Shared<M>>,
    id: RequestId,
    caller: CancellationToken,
    request: CancellationToken,
) {
    tokio::select! {
        biased;
        // Settled or disposed.
        _ = request.cancelled() => {}
        _ = caller.cancelled() => {
            request.cancel();
            shared.on_cancel(id).await;
        }
    }
}

/// Builder for [`LanguageModelQueue`].
pub struct LanguageModelQueueBuilder<M: LanguageModel> {
    model: Arc<M>,
    limits: ModelLimits,
    estimator: Option<Arc<dyn TokenEstimator<M::Payload>>>,
    config: QueueConfig,
    store: Option<Arc<dyn QueueStore>>,
    sink: EventSink,
}

impl<M: LanguageModel> LanguageModelQueueBuilder<M> {
    /// Required.
    pub fn estimator<E: TokenEstimator<M::Payload> + 'static>(mut self, estimator: E) -> Self {
        self.estimator = Some(Arc::new(estimator));
        self
    }

    pub fn shared_estimator(mut self, estimator: Arc<dyn TokenEstimator<M::Payload>>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Store shared with cooperating instances. Defaults to a private in-memory store.
    pub fn store<S: QueueStore + 'static>(self, store: S) -> Self {
        self.shared_store(Arc::new(store))
    }

    pub fn shared_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink<S: TelemetrySink>(mut self, sink: S) -> Self {
        self.sink = EventSink::new(sink);
        self
    }

    pub(crate) fn event_sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Validate and start the gate loop. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<LanguageModelQueue<M>, ConfigError> {
        let estimator = self.estimator.ok_or(ConfigError::MissingEstimator)?;
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryQueueStore::new()));
        let max_concurrent = self.config.max_concurrent_requests();
        if max_concurrent == 0 {
            return Err(ConfigError::Zero { field: "max_concurrent_requests" });
        }

        let shared = Arc::new(Shared {
            model: self.model,
            store,
            policy: self.limits.budget_policy(),
            limits: self.limits,
            config: self.config,
            max_concurrent: DynamicConfig::new(max_concurrent),
            local: Mutex::default(),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            sink: self.sink,
        });
        info!(
            target: "lmqueue::gate",
            model_key = %shared.model_key(),
            instance = %shared.instance(),
            max_concurrent_requests = max_concurrent,
            tokens_per_minute = shared.limits.tokens_per_minute(),
            "queue created"
        );
        let gate = tokio::spawn(gate::run(shared.clone()));

        Ok(LanguageModelQueue {
            shared,
            estimator,
            gate: Mutex::new(Some(gate)),
            disposed: AtomicBool::new(false),
        })
    }
}
