mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{config, limits, prompt, FakeModel, Step};
use lmqueue::store::{ModelState, Versioned};
use lmqueue::{
    Backoff, CasQueueStore, InMemoryStateBackend, Jitter, LanguageModelQueue, Method,
    QueueConfig, StateBackend, StoreError, TokioClock, TrackingSleeper,
};

/// Loses the compare-and-set race a fixed number of times before behaving.
#[derive(Debug, Default)]
struct Flaky {
    inner: InMemoryStateBackend,
    losses_left: AtomicUsize,
    writes: AtomicUsize,
}

#[async_trait]
impl StateBackend for Flaky {
    async fn get_state(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.inner.get_state(key).await
    }

    async fn set_state(&self, key: &str, state: &ModelState, prev_version: Option<u64>) -> Result<bool, StoreError> {
        if self
            .losses_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_state(key, state, prev_version).await
    }
}

/// Fails every read while `outage_left` is above zero.
#[derive(Debug, Default)]
struct Outage {
    inner: InMemoryStateBackend,
    outage_left: AtomicUsize,
}

#[async_trait]
impl StateBackend for Outage {
    async fn get_state(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        if self
            .outage_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::backend("connection refused"));
        }
        self.inner.get_state(key).await
    }

    async fn set_state(&self, key: &str, state: &ModelState, prev_version: Option<u64>) -> Result<bool, StoreError> {
        self.inner.set_state(key, state, prev_version).await
    }
}

#[tokio::test(start_paused = true)]
async fn queues_cooperate_through_a_versioned_backend() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script("A", [Step::Sleep(Duration::from_millis(200))]);
    let backend = InMemoryStateBackend::new();
    let store = Arc::new(CasQueueStore::new(backend.clone()).with_prefix("test"));

    let build = |instance: &str| {
        LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
            .estimator(common::estimate)
            .config(config(&clock, instance, 1))
            .shared_store(store.clone())
            .build()
            .unwrap()
    };
    let first = build("first");
    let second = build("second");

    let a = first.submit(Method::GenerateText, prompt("A", 10), None).await.unwrap();
    let b = second.submit(Method::GenerateText, prompt("B", 10), None).await.unwrap();
    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(model.calls(), vec!["A", "B"]);
    assert_eq!(model.max_in_flight(), 1);

    let stored = backend.get_state("test:m").await.unwrap().unwrap();
    assert!(stored.state.records.is_empty());
    assert!(stored.version > 1);
    first.dispose().await;
    second.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn lost_races_are_retried() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let backend = Arc::new(Flaky { losses_left: AtomicUsize::new(3), ..Default::default() });
    let store = CasQueueStore::from_arc(backend.clone());
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config(&clock, "q", 1))
        .store(store)
        .build()
        .unwrap();

    assert_eq!(queue.generate_text(prompt("A", 10), None).await.unwrap().text, "A:ok");
    assert_eq!(backend.losses_left.load(Ordering::SeqCst), 0);
    assert!(backend.writes.load(Ordering::SeqCst) > 0);
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_contention_surfaces_as_store_error() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let backend = Arc::new(Flaky { losses_left: AtomicUsize::new(usize::MAX), ..Default::default() });
    let store = CasQueueStore::from_arc(backend).with_max_attempts(4);
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config(&clock, "q", 1))
        .store(store)
        .build()
        .unwrap();

    let err = queue.generate_text(prompt("A", 10), None).await.unwrap_err();
    assert!(err.is_store());
    assert!(err.to_string().contains("4 attempts"));
    assert!(model.calls().is_empty());
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn store_outage_backs_off_then_recovers() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let sleeper = TrackingSleeper::new();
    let backend = Arc::new(Outage::default());
    let config = QueueConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .store_backoff(Backoff::exponential(Duration::from_millis(100)))
        .store_jitter(Jitter::None)
        .sleeper(sleeper.clone())
        .instance_id("q")
        .clock(clock.clone())
        .build()
        .unwrap();
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config)
        .store(CasQueueStore::from_arc(backend.clone()))
        .build()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    backend.outage_left.store(3, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(backend.outage_left.load(Ordering::SeqCst), 0);

    let backoff: Vec<Duration> = [100, 200, 400].map(Duration::from_millis).to_vec();
    let calls = sleeper.calls();
    assert!(calls.windows(3).any(|w| w == backoff.as_slice()), "sleeps: {calls:?}");

    assert_eq!(queue.generate_text(prompt("A", 10), None).await.unwrap().text, "A:ok");
    queue.dispose().await;
}
