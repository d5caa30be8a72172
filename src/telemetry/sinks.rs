//! Built-in telemetry sinks.
//!
//! Every sink is a `tower::Service<QueueEvent>`. The in-process ones never fail and are always
//! ready; `MulticastSink` reports the first error of either branch.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use super::events::QueueEvent;
use crate::request::RequestId;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes queue events.
pub trait TelemetrySink:
    tower::Service<QueueEvent, Response = (), Error = Self::SinkError, Future = Self::SinkFuture>
    + Clone
    + Send
    + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
    type SinkFuture: Future<Output = Result<(), Self::SinkError>> + Send + 'static;
}

/// Emit one event, waiting for `poll_ready`, and discard any error.
pub async fn emit_best_effort<S>(sink: S, event: QueueEvent)
where
    S: tower::Service<QueueEvent, Response = ()> + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready) = sink.ready_oneshot().await {
        let _ = ready.call(event).await;
    }
}

/// Service and sink impls for a type whose `record(&mut self, QueueEvent)` cannot fail.
macro_rules! infallible_sink {
    ($ty:ty) => {
        impl Service<QueueEvent> for $ty {
            type Response = ();
            type Error = Infallible;
            type Future = SinkFuture<Infallible>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, event: QueueEvent) -> Self::Future {
                self.record(event);
                Box::pin(std::future::ready(Ok(())))
            }
        }

        impl TelemetrySink for $ty {
            type SinkError = Infallible;
            type SinkFuture = SinkFuture<Infallible>;
        }
    };
}

/// Discards every event. The default for queues built without a sink.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl NullSink {
    fn record(&mut self, _event: QueueEvent) {}
}

infallible_sink!(NullSink);

/// Logs events through `tracing` under `lmqueue::telemetry`.
///
/// Per-request admission events log at `debug`, settlements and recalibrations at `info`,
/// rate limits and reclamation at `warn`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn record(&mut self, event: QueueEvent) {
        let model_key = event.model_key().to_string();
        match &event {
            QueueEvent::Enqueued { .. } | QueueEvent::Dispatched { .. } => {
                debug!(target: "lmqueue::telemetry", model_key = %model_key, event = %event, "queue_event")
            }
            QueueEvent::RateLimited { .. } | QueueEvent::Reclaimed { .. } => {
                warn!(target: "lmqueue::telemetry", model_key = %model_key, event = %event, "queue_event")
            }
            _ => info!(target: "lmqueue::telemetry", model_key = %model_key, event = %event, "queue_event"),
        }
    }
}

infallible_sink!(LogSink);

/// Ring buffer of the most recent events; the oldest is evicted at capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<QueueEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<QueueEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&mut self, event: QueueEvent) {
        let mut buffer = self.buffer();
        if buffer.len() == self.capacity {
            buffer.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.buffer().iter().cloned().collect()
    }

    /// The lifecycle of one request, oldest first.
    pub fn events_for(&self, request_id: RequestId) -> Vec<QueueEvent> {
        self.buffer().iter().filter(|e| e.request_id() == Some(request_id)).cloned().collect()
    }

    pub fn clear(&self) {
        self.buffer().clear();
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Events pushed out by newer ones since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

infallible_sink!(MemorySink);

/// Hands events to a worker task over a bounded channel so a slow sink never delays the
/// gate. Events are dropped (and counted) while the channel is full.
///
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: mpsc::Sender<QueueEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<QueueEvent, Response = ()> + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<QueueEvent>(capacity.max(1));
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(event) = rx.recv().await {
                let Ok(ready) = sink.ready().await else {
                    warn!(target: "lmqueue::telemetry", "telemetry worker stopped: sink failed readiness");
                    break;
                };
                let _ = ready.call(event).await;
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    fn record(&mut self, event: QueueEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink")
            .field("capacity", &self.tx.max_capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

infallible_sink!(NonBlockingSink);

/// Error from one branch of a [`MulticastSink`].
#[derive(Debug, thiserror::Error)]
#[error("telemetry sink error: {0}")]
pub struct MulticastError(#[source] Box<dyn std::error::Error + Send + Sync>);

/// Sends every event to both sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<QueueEvent> for MulticastSink<A, B>
where
    A: TelemetrySink,
    B: TelemetrySink,
{
    type Response = ();
    type Error = MulticastError;
    type Future = SinkFuture<MulticastError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each branch is driven to readiness by `oneshot` on a clone.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QueueEvent) -> Self::Future {
        let first = self.first.clone().oneshot(event.clone());
        let second = self.second.clone().oneshot(event);
        Box::pin(async move {
            let (a, b) = tokio::join!(first, second);
            a.map_err(|e| MulticastError(Box::new(e)))?;
            b.map_err(|e| MulticastError(Box::new(e)))
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: TelemetrySink,
    B: TelemetrySink,
{
    type SinkError = MulticastError;
    type SinkFuture = SinkFuture<MulticastError>;
}
