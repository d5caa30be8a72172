//! Validated per-model limits and per-queue settings.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::budget::{BudgetPolicy, RefillMode};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::jitter::Jitter;
use crate::request::InstanceId;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Provider limits for one model key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelLimits {
    model_key: String,
    max_tokens_per_message: u64,
    tokens_per_minute: u64,
    requests_per_minute: Option<u64>,
    #[cfg_attr(feature = "serde", serde(default))]
    refill: RefillMode,
}

impl ModelLimits {
    /// Validate and create limits.
    ///
    /// `max_tokens_per_message` may not exceed `tokens_per_minute`: a message larger than a
    /// full budget would block the head of the queue forever.
    pub fn new(
        model_key: impl Into<String>,
        max_tokens_per_message: u64,
        tokens_per_minute: u64,
    ) -> Result<Self, ConfigError> {
        let model_key = model_key.into();
        if model_key.trim().is_empty() {
            return Err(ConfigError::EmptyModelKey);
        }
        if max_tokens_per_message == 0 {
            return Err(ConfigError::Zero { field: "max_tokens_per_message" });
        }
        if tokens_per_minute == 0 {
            return Err(ConfigError::Zero { field: "tokens_per_minute" });
        }
        if max_tokens_per_message > tokens_per_minute {
            return Err(ConfigError::MessageExceedsRate {
                max_tokens: max_tokens_per_message,
                tokens_per_minute,
            });
        }
        Ok(Self {
            model_key,
            max_tokens_per_message,
            tokens_per_minute,
            requests_per_minute: None,
            refill: RefillMode::Linear,
        })
    }

    pub fn with_requests_per_minute(mut self, requests_per_minute: u64) -> Result<Self, ConfigError> {
        if requests_per_minute == 0 {
            return Err(ConfigError::Zero { field: "requests_per_minute" });
        }
        self.requests_per_minute = Some(requests_per_minute);
        Ok(self)
    }

    pub fn with_refill(mut self, refill: RefillMode) -> Self {
        self.refill = refill;
        self
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    pub fn max_tokens_per_message(&self) -> u64 {
        self.max_tokens_per_message
    }

    pub fn tokens_per_minute(&self) -> u64 {
        self.tokens_per_minute
    }

    pub fn requests_per_minute(&self) -> Option<u64> {
        self.requests_per_minute
    }

    pub fn refill(&self) -> RefillMode {
        self.refill
    }

    /// Budget ceilings derived from these limits.
    pub fn budget_policy(&self) -> BudgetPolicy {
        BudgetPolicy {
            tokens_per_minute: self.tokens_per_minute,
            requests_per_minute: self.requests_per_minute,
            refill: self.refill,
        }
    }
}

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settings of one queue instance. Build with [`QueueConfig::builder`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    max_concurrent_requests: usize,
    lease_duration: Duration,
    poll_interval: Duration,
    default_retry_after: Duration,
    store_backoff: Backoff,
    store_jitter: Jitter,
    instance_id: InstanceId,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Initial concurrency ceiling; the live value can be changed on the queue.
    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Used when the provider rate-limits a call without a retry-after hint.
    pub fn default_retry_after(&self) -> Duration {
        self.default_retry_after
    }

    pub fn store_backoff(&self) -> Backoff {
        self.store_backoff
    }

    pub fn store_jitter(&self) -> Jitter {
        self.store_jitter
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Same settings, different instance id. Used by the registry so each model key gets
    /// its own identity.
    pub fn with_instance_id(mut self, instance_id: InstanceId) -> Self {
        self.instance_id = instance_id;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1,
            lease_duration: DEFAULT_LEASE_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_retry_after: DEFAULT_RETRY_AFTER,
            store_backoff: Backoff::default(),
            store_jitter: Jitter::default(),
            instance_id: InstanceId::generate(),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

/// Builder for [`QueueConfig`].
///
/// ```rust
/// use std::time::Duration;
/// use lmqueue::QueueConfig;
///
/// let config = QueueConfig::builder()
///     .max_concurrent_requests(4)
///     .lease_duration(Duration::from_secs(120))
///     .instance_id("worker-a")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_requests(), 4);
/// assert_eq!(config.instance_id().as_str(), "worker-a");
/// ```
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    inner: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.inner.max_concurrent_requests = max;
        self
    }

    /// How long a claim survives without a heartbeat before another instance reclaims it.
    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.inner.lease_duration = lease;
        self
    }

    /// Upper bound on how long the gate sleeps between admission attempts.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.inner.poll_interval = interval;
        self
    }

    pub fn default_retry_after(mut self, retry_after: Duration) -> Self {
        self.inner.default_retry_after = retry_after;
        self
    }

    pub fn store_backoff(mut self, backoff: Backoff) -> Self {
        self.inner.store_backoff = backoff;
        self
    }

    pub fn store_jitter(mut self, jitter: Jitter) -> Self {
        self.inner.store_jitter = jitter;
        self
    }

    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.inner.instance_id = id.into();
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.inner.clock = Arc::new(clock);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.inner.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<QueueConfig, ConfigError> {
        let config = self.inner;
        if config.max_concurrent_requests == 0 {
            return Err(ConfigError::Zero { field: "max_concurrent_requests" });
        }
        if config.poll_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::TooShort { field: "poll_interval", min_ms: 1 });
        }
        // Heartbeats ride on gate ticks; a lease shorter than two ticks would expire between them.
        let min_lease = config.poll_interval.saturating_mul(2);
        if config.lease_duration < min_lease {
            return Err(ConfigError::TooShort {
                field: "lease_duration",
                min_ms: u64::try_from(min_lease.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(config)
    }
}
