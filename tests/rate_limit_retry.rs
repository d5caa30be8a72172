mod common;

use std::time::Duration;

use async_trait::async_trait;
use common::{config, limits, prompt, FakeError, FakeModel, Step};
use lmqueue::store::{ClaimOutcome, ClaimRequest, QueueStats, ReclaimReport};
use lmqueue::telemetry::MemorySink;
use lmqueue::{
    BudgetPolicy, BudgetUpdate, InMemoryQueueStore, InstanceId, LanguageModelQueue, Method,
    QueueConfig, QueueEvent, QueueStore, RequestId, RequestRecord, RequestStatus, StoreError,
    TokenBudget, TokioClock,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn queue_with_sink(
    model: &FakeModel,
    config: QueueConfig,
) -> (LanguageModelQueue<FakeModel>, MemorySink) {
    let sink = MemorySink::new();
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config)
        .sink(sink.clone())
        .build()
        .unwrap();
    (queue, sink)
}

fn rate_limit_events(sink: &MemorySink) -> Vec<(Duration, bool)> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::RateLimited { retry_after, requeued, .. } => Some((retry_after, requeued)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn rate_limited_request_retries_once_after_retry_after() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script("A", [Step::RateLimit(Some(Duration::from_secs(2))), Step::Reply]);
    let (queue, sink) = queue_with_sink(&model, config(&clock, "q", 1));

    let start = Instant::now();
    let a = queue.submit(Method::GenerateText, prompt("A", 100), None).await.unwrap();
    model.wait_for_calls(1).await;

    // Held at zero until the provider's retry-after elapses.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.budget().await.unwrap().tokens(), 0);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(queue.budget().await.unwrap().tokens(), 0);
    assert_eq!(model.calls(), vec!["A"]);

    assert_eq!(a.await.unwrap().text, "A:ok");
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(model.calls(), vec!["A", "A"]);
    assert_eq!(rate_limit_events(&sink), vec![(Duration::from_secs(2), true)]);

    // Reset to the ceiling at the retry-after mark, then charged for the retry.
    let tokens = queue.budget().await.unwrap().tokens();
    assert!((89_900..=90_000).contains(&tokens), "budget after retry: {tokens}");
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn second_rate_limit_surfaces_the_provider_error() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script("A", [Step::RateLimit(None), Step::RateLimit(None)]);
    let config = QueueConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .default_retry_after(Duration::from_secs(3))
        .instance_id("q")
        .clock(clock.clone())
        .build()
        .unwrap();
    let (queue, sink) = queue_with_sink(&model, config);

    let start = Instant::now();
    let err = queue.generate_text(prompt("A", 100), None).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(err.into_provider(), Some(FakeError::RateLimited(None)));
    assert_eq!(model.calls(), vec!["A", "A"]);
    assert_eq!(
        rate_limit_events(&sink),
        vec![(Duration::from_secs(3), true), (Duration::from_secs(3), false)]
    );
    assert_eq!(queue.metrics().await.unwrap().queue_size, 0);
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn retried_request_keeps_its_place_at_the_head() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script("A", [Step::RateLimit(Some(Duration::from_secs(1))), Step::Reply]);
    let (queue, _sink) = queue_with_sink(&model, config(&clock, "q", 1));

    let a = queue.submit(Method::GenerateText, prompt("A", 10), None).await.unwrap();
    model.wait_for_calls(1).await;
    let b = queue.submit(Method::GenerateText, prompt("B", 10), None).await.unwrap();

    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(model.calls(), vec!["A", "A", "B"]);
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_retry_wait_aborts() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script("A", [Step::RateLimit(Some(Duration::from_secs(30))), Step::Reply]);
    let (queue, _sink) = queue_with_sink(&model, config(&clock, "q", 1));

    let token = tokio_util::sync::CancellationToken::new();
    let a = queue.submit(Method::GenerateText, prompt("A", 10), Some(token.clone())).await.unwrap();
    model.wait_for_calls(1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    token.cancel();
    assert!(a.await.unwrap_err().is_aborted());
    assert_eq!(model.calls(), vec!["A"]);
    assert_eq!(queue.metrics().await.unwrap().queue_size, 0);
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn cancellation_that_races_a_second_rate_limit_aborts() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let token = CancellationToken::new();
    model.script(
        "A",
        [Step::RateLimit(Some(Duration::from_secs(1))), Step::CancelThenRateLimit(token.clone())],
    );
    let (queue, sink) = queue_with_sink(&model, config(&clock, "q", 1));

    let err = queue.generate_text(prompt("A", 10), Some(token)).await.unwrap_err();
    assert!(err.is_aborted(), "got {err:?}");
    assert_eq!(model.calls(), vec!["A", "A"]);
    assert_eq!(
        rate_limit_events(&sink),
        vec![(Duration::from_secs(1), true), (Duration::from_secs(60), false)]
    );
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, QueueEvent::Settled { status: RequestStatus::Aborted, .. })));
    assert_eq!(queue.metrics().await.unwrap().queue_size, 0);
    queue.dispose().await;
}

/// In-memory store whose `requeue_front` always fails.
#[derive(Debug, Default)]
struct RequeueFails(InMemoryQueueStore);

#[async_trait]
impl QueueStore for RequeueFails {
    async fn enqueue(&self, record: RequestRecord, now: u64) -> Result<(), StoreError> {
        self.0.enqueue(record, now).await
    }

    async fn try_claim_head(
        &self,
        model_key: &str,
        claim: &ClaimRequest,
        now: u64,
    ) -> Result<ClaimOutcome, StoreError> {
        self.0.try_claim_head(model_key, claim, now).await
    }

    async fn remove(&self, model_key: &str, id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        self.0.remove(model_key, id).await
    }

    async fn release(
        &self,
        model_key: &str,
        id: RequestId,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<Option<RequestRecord>, StoreError> {
        self.0.release(model_key, id, policy, now).await
    }

    async fn requeue_front(&self, _model_key: &str, _id: RequestId) -> Result<bool, StoreError> {
        Err(StoreError::backend("connection reset"))
    }

    async fn budget(&self, model_key: &str, policy: &BudgetPolicy, now: u64) -> Result<TokenBudget, StoreError> {
        self.0.budget(model_key, policy, now).await
    }

    async fn update_budget(
        &self,
        model_key: &str,
        update: &BudgetUpdate,
        policy: &BudgetPolicy,
        now: u64,
    ) -> Result<TokenBudget, StoreError> {
        self.0.update_budget(model_key, update, policy, now).await
    }

    async fn heartbeat(
        &self,
        model_key: &str,
        instance: &InstanceId,
        in_flight: &[RequestId],
        now: u64,
    ) -> Result<(), StoreError> {
        self.0.heartbeat(model_key, instance, in_flight, now).await
    }

    async fn reclaim_expired(
        &self,
        model_key: &str,
        policy: &BudgetPolicy,
        lease: Duration,
        now: u64,
    ) -> Result<ReclaimReport, StoreError> {
        self.0.reclaim_expired(model_key, policy, lease, now).await
    }

    async fn stats(&self, model_key: &str) -> Result<QueueStats, StoreError> {
        self.0.stats(model_key).await
    }
}

#[tokio::test(start_paused = true)]
async fn failed_requeue_does_not_earn_a_second_retry() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script(
        "A",
        [
            Step::RateLimit(Some(Duration::from_millis(100))),
            Step::RateLimit(Some(Duration::from_millis(100))),
            Step::Reply,
        ],
    );
    let sink = MemorySink::new();
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config(&clock, "q", 1))
        .store(RequeueFails::default())
        .sink(sink.clone())
        .build()
        .unwrap();

    // The record stays claimed in the store until its 2 s lease lapses and it is reclaimed.
    let start = Instant::now();
    let err = queue.generate_text(prompt("A", 10), None).await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(err.into_provider(), Some(FakeError::RateLimited(Some(Duration::from_millis(100)))));
    assert_eq!(model.calls(), vec!["A", "A"]);
    assert_eq!(
        rate_limit_events(&sink),
        vec![(Duration::from_millis(100), true), (Duration::from_millis(100), false)]
    );
    queue.dispose().await;
}
