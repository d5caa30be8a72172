//! Telemetry for queue instances.
//!
//! Queues emit [`QueueEvent`]s to a [`TelemetrySink`], a `tower::Service<QueueEvent>`.
//! Emission is best-effort: sink errors are swallowed and never affect request handling.
//!
//! - **Admission**: `Enqueued`, `Rejected`, `Dispatched`
//! - **Completion**: `Settled`, `RateLimited`
//! - **Budget and self-healing**: `BudgetRecalibrated`, `Reclaimed`

pub mod events;
pub mod sinks;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::QueueEvent;
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, MulticastError, MulticastSink, NonBlockingSink,
    NullSink, TelemetrySink,
};

type Emit = dyn Fn(QueueEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

/// Type-erased sink held by a queue, shareable across its tasks.
#[derive(Clone)]
pub(crate) struct EventSink {
    emit: Arc<Emit>,
}

impl EventSink {
    pub(crate) fn new<S: TelemetrySink>(sink: S) -> Self {
        let sink = Mutex::new(sink);
        Self {
            emit: Arc::new(move |event| {
                let sink = sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
                Box::pin(emit_best_effort(sink, event))
            }),
        }
    }

    pub(crate) async fn emit(&self, event: QueueEvent) {
        (self.emit)(event).await
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSink")
    }
}
