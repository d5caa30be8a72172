//! One queue per model key, all sharing a model client, store and estimator.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use tracing::{info, warn};

use crate::config::{ModelLimits, QueueConfig};
use crate::error::{ConfigError, StoreError};
use crate::model::{LanguageModel, TokenEstimator};
use crate::queue::{LanguageModelQueue, QueueMetrics};
use crate::request::InstanceId;
use crate::store::{InMemoryQueueStore, QueueStore};
use crate::telemetry::{EventSink, TelemetrySink};

/// Lazily creates and tracks queues by model key.
///
/// Each queue gets the instance id `"{base}:{model_key}"`, where `base` is the configured
/// instance id, so heartbeats of different model keys never collide.
pub struct QueueRegistry<M: LanguageModel> {
    model: Arc<M>,
    estimator: Arc<dyn TokenEstimator<M::Payload>>,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    sink: EventSink,
    queues: RwLock<HashMap<String, Arc<LanguageModelQueue<M>>>>,
}

impl<M: LanguageModel> std::fmt::Debug for QueueRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("instance_id", self.config.instance_id())
            .field("model_keys", &self.model_keys())
            .finish()
    }
}

impl<M: LanguageModel> QueueRegistry<M> {
    /// Registry over a private in-memory store.
    pub fn new<E>(model: impl Into<Arc<M>>, estimator: E, config: QueueConfig) -> Self
    where
        E: TokenEstimator<M::Payload> + 'static,
    {
        Self::with_store(model, estimator, Arc::new(InMemoryQueueStore::new()), config)
    }

    pub fn with_store<E>(
        model: impl Into<Arc<M>>,
        estimator: E,
        store: Arc<dyn QueueStore>,
        config: QueueConfig,
    ) -> Self
    where
        E: TokenEstimator<M::Payload> + 'static,
    {
        Self {
            model: model.into(),
            estimator: Arc::new(estimator),
            store,
            config,
            sink: EventSink::default(),
            queues: RwLock::default(),
        }
    }

    /// Telemetry sink shared by every queue created afterwards.
    pub fn with_sink<S: TelemetrySink>(mut self, sink: S) -> Self {
        self.sink = EventSink::new(sink);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<LanguageModelQueue<M>>>> {
        self.queues.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<LanguageModelQueue<M>>>> {
        self.queues.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue for `limits.model_key()`, created on first use. Must be called inside a Tokio
    /// runtime.
    ///
    /// An existing queue is returned as is; differing limits are logged and ignored.
    pub fn get_or_create(&self, limits: ModelLimits) -> Result<Arc<LanguageModelQueue<M>>, ConfigError> {
        if let Some(queue) = self.read().get(limits.model_key()) {
            warn_on_mismatch(queue, &limits);
            return Ok(queue.clone());
        }

        let mut queues = self.write();
        if let Some(queue) = queues.get(limits.model_key()) {
            warn_on_mismatch(queue, &limits);
            return Ok(queue.clone());
        }
        let model_key = limits.model_key().to_string();
        let instance_id = InstanceId::new(format!("{}:{}", self.config.instance_id(), model_key));
        let queue = LanguageModelQueue::builder(self.model.clone(), limits)
            .shared_estimator(self.estimator.clone())
            .shared_store(self.store.clone())
            .config(self.config.clone().with_instance_id(instance_id))
            .event_sink(self.sink.clone())
            .build()?;
        let queue = Arc::new(queue);
        info!(target: "lmqueue::registry", model_key = %model_key, instance = %queue.instance_id(), "queue registered");
        queues.insert(model_key, queue.clone());
        Ok(queue)
    }

    pub fn get(&self, model_key: &str) -> Option<Arc<LanguageModelQueue<M>>> {
        self.read().get(model_key).cloned()
    }

    /// Registered model keys, sorted.
    pub fn model_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Metrics of every queue, sorted by model key.
    pub async fn snapshot(&self) -> Result<Vec<QueueMetrics>, StoreError> {
        let queues: Vec<Arc<LanguageModelQueue<M>>> = self.read().values().cloned().collect();
        let mut metrics = Vec::with_capacity(queues.len());
        for queue in queues {
            metrics.push(queue.metrics().await?);
        }
        metrics.sort_by(|a, b| a.model_key.cmp(&b.model_key));
        Ok(metrics)
    }

    /// Dispose and forget every queue.
    pub async fn dispose_all(&self) {
        let queues: Vec<Arc<LanguageModelQueue<M>>> =
            self.write().drain().map(|(_, queue)| queue).collect();
        join_all(queues.iter().map(|queue| queue.dispose())).await;
        info!(target: "lmqueue::registry", disposed = queues.len(), "registry disposed");
    }
}

fn warn_on_mismatch<M: LanguageModel>(queue: &LanguageModelQueue<M>, limits: &ModelLimits) {
    if queue.limits() != limits {
        warn!(target: "lmqueue::registry", model_key = %limits.model_key(), "queue already registered with different limits; keeping the existing queue");
    }
}
