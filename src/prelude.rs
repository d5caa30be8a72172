//! Convenient re-exports for common lmqueue types.
pub use crate::{
    budget::{RateLimitSnapshot, TokenBudget},
    config::{ModelLimits, QueueConfig},
    error::{ConfigError, QueueError, StoreError},
    model::{CharsPerToken, FailureKind, LanguageModel, TokenEstimator},
    queue::{LanguageModelQueue, QueueMetrics, QueuedResponse},
    registry::QueueRegistry,
    request::{Method, RequestId},
    store::{InMemoryQueueStore, QueueStore},
    telemetry::{LogSink, MemorySink, QueueEvent},
};
