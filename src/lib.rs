#![forbid(unsafe_code)]

//! # lmqueue
//!
//! Rate-aware FIFO admission queue for language-model calls.
//!
//! Requests for one model key wait in a single FIFO order shared by every cooperating queue
//! instance. The head of the queue is dispatched only when the shared token budget and the
//! concurrency ceiling both admit it; nothing behind a blocked head may overtake it.
//!
//! ## Features
//!
//! - **Token budgets** refilled per minute and recalibrated from provider telemetry
//! - **Bounded concurrency**, tunable at runtime
//! - **Cooperative cancellation** through `CancellationToken`, forwarded into in-flight calls
//! - **One automatic retry** at the head of the queue when the provider rate-limits anyway
//! - **Shared stores**: in-process, or any compare-and-set backend (see `lmqueue-redis`)
//! - **Lease reclamation** of work claimed by instances that stopped heartbeating
//! - **Telemetry** as a `tower::Service<QueueEvent>`
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use lmqueue::{CharsPerToken, LanguageModel, LanguageModelQueue, Method, ModelLimits};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Provider;
//!
//! #[async_trait]
//! impl LanguageModel for Provider {
//!     type Payload = String;
//!     type Response = String;
//!     type Error = std::io::Error;
//!
//!     async fn call(&self, _: Method, prompt: &String, _: CancellationToken) -> Result<String, std::io::Error> {
//!         Ok(format!("echo: {prompt}"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let limits = ModelLimits::new("openai/gpt-4o", 4_096, 90_000).unwrap();
//!     let queue = LanguageModelQueue::new(Provider, limits, CharsPerToken::default(), 4).unwrap();
//!
//!     let reply = queue.generate_text("hello".to_string(), None).await.unwrap();
//!     assert_eq!(reply, "echo: hello");
//!     queue.dispose().await;
//! }
//! ```

pub mod adaptive;
pub mod admission;
pub mod backoff;
pub mod budget;
pub mod clock;
pub mod config;
mod dispatcher;
pub mod error;
mod gate;
mod instance;
pub mod jitter;
pub mod model;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod request;
pub mod sleeper;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use admission::{Admission, BlockReason};
pub use backoff::{Backoff, MAX_BACKOFF};
pub use budget::{BudgetPolicy, BudgetUpdate, RateLimitSnapshot, RefillMode, TokenBudget};
pub use clock::{Clock, MonotonicClock, SystemClock, TokioClock};
pub use config::{ModelLimits, QueueConfig, QueueConfigBuilder};
pub use error::{ConfigError, QueueError, StoreError};
pub use jitter::Jitter;
pub use model::{CharsPerToken, FailureKind, LanguageModel, TokenEstimator};
pub use queue::{LanguageModelQueue, LanguageModelQueueBuilder, QueueMetrics, QueuedResponse};
pub use registry::QueueRegistry;
pub use request::{InstanceId, Method, RequestId, RequestRecord, RequestStatus};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{CasQueueStore, InMemoryQueueStore, InMemoryStateBackend, QueueStore, StateBackend};
pub use telemetry::{QueueEvent, TelemetrySink};
