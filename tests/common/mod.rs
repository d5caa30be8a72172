#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lmqueue::{
    FailureKind, LanguageModel, LanguageModelQueue, Method, ModelLimits, QueueConfig,
    RateLimitSnapshot, TokioClock,
};
use tokio_util::sync::CancellationToken;

/// Request body used by the fake provider; `tokens` is what the estimator reports.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub name: &'static str,
    pub tokens: u64,
}

pub fn prompt(name: &'static str, tokens: u64) -> Prompt {
    Prompt { name, tokens }
}

pub fn estimate(prompt: &Prompt) -> u64 {
    prompt.tokens
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub telemetry: Option<RateLimitSnapshot>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FakeError {
    #[error("rate limited")]
    RateLimited(Option<Duration>),
    #[error("upstream: {0}")]
    Upstream(String),
}

/// What the fake provider does on one call for a given prompt name.
#[derive(Debug, Clone)]
pub enum Step {
    Reply,
    ReplyWith(RateLimitSnapshot),
    Fail(&'static str),
    RateLimit(Option<Duration>),
    /// Fire the caller's token, then answer with a rate limit in the same poll.
    CancelThenRateLimit(CancellationToken),
    /// Reply after this much (tokio) time.
    Sleep(Duration),
    /// Never complete on its own.
    Hang,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: Mutex<HashMap<&'static str, VecDeque<Step>>>,
    calls: Mutex<Vec<(&'static str, Method)>>,
    cancelled: Mutex<Vec<&'static str>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Scripted provider. Prompts without a script reply immediately.
#[derive(Debug, Clone, Default)]
pub struct FakeModel {
    inner: Arc<Inner>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, name: &'static str, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.inner.scripts.lock().unwrap().entry(name).or_default().extend(steps);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.calls.lock().unwrap().iter().map(|(name, _)| *name).collect()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.inner.calls.lock().unwrap().iter().map(|(_, method)| *method).collect()
    }

    pub fn cancelled(&self) -> Vec<&'static str> {
        self.inner.cancelled.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait (on tokio time) until `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

struct CallGuard {
    inner: Arc<Inner>,
    name: &'static str,
    cancel: CancellationToken,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.cancel.is_cancelled() {
            self.inner.cancelled.lock().unwrap().push(self.name);
        }
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    type Payload = Prompt;
    type Response = Reply;
    type Error = FakeError;

    async fn call(
        &self,
        method: Method,
        payload: &Prompt,
        cancel: CancellationToken,
    ) -> Result<Reply, FakeError> {
        let name = payload.name;
        self.inner.calls.lock().unwrap().push((name, method));
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = CallGuard { inner: self.inner.clone(), name, cancel };

        let step = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Reply);
        let ok = |telemetry: Option<RateLimitSnapshot>| -> Result<Reply, FakeError> {
            Ok(Reply { text: format!("{name}:ok"), telemetry })
        };
        match step {
            Step::Reply => ok(None),
            Step::ReplyWith(snapshot) => ok(Some(snapshot)),
            Step::Fail(message) => Err(FakeError::Upstream(message.to_string())),
            Step::RateLimit(retry_after) => Err(FakeError::RateLimited(retry_after)),
            Step::CancelThenRateLimit(token) => {
                token.cancel();
                Err(FakeError::RateLimited(None))
            }
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                ok(None)
            }
            Step::Hang => std::future::pending().await,
        }
    }

    fn response_telemetry(&self, response: &Reply) -> Option<RateLimitSnapshot> {
        response.telemetry
    }

    fn classify_error(&self, error: &FakeError) -> FailureKind {
        match error {
            FakeError::RateLimited(retry_after) => FailureKind::RateLimited { retry_after: *retry_after },
            FakeError::Upstream(_) => FailureKind::Other,
        }
    }
}

pub fn limits(model_key: &str, max_tokens: u64, tokens_per_minute: u64) -> ModelLimits {
    ModelLimits::new(model_key, max_tokens, tokens_per_minute).unwrap()
}

/// Settings for paused-time tests: tokio-driven clock, short poll.
pub fn config(clock: &TokioClock, instance: &str, max_concurrent: usize) -> QueueConfig {
    QueueConfig::builder()
        .max_concurrent_requests(max_concurrent)
        .poll_interval(Duration::from_millis(50))
        .lease_duration(Duration::from_secs(2))
        .instance_id(instance)
        .clock(clock.clone())
        .build()
        .unwrap()
}

pub fn queue(model: &FakeModel, limits: ModelLimits, config: QueueConfig) -> LanguageModelQueue<FakeModel> {
    LanguageModelQueue::builder(model.clone(), limits)
        .estimator(estimate)
        .config(config)
        .build()
        .unwrap()
}
