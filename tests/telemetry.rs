mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{config, limits, prompt, FakeModel, Step};
use lmqueue::telemetry::{MemorySink, MulticastSink, LogSink};
use lmqueue::{
    LanguageModelQueue, Method, QueueEvent, RateLimitSnapshot, RequestStatus, TokioClock,
};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn queue_with_sink(model: &FakeModel, clock: &TokioClock) -> (LanguageModelQueue<FakeModel>, MemorySink) {
    let sink = MemorySink::new();
    let queue = LanguageModelQueue::builder(model.clone(), limits("m", 1_000, 90_000))
        .estimator(common::estimate)
        .config(config(clock, "q", 1))
        .sink(MulticastSink::new(sink.clone(), LogSink))
        .build()
        .unwrap();
    (queue, sink)
}

#[tokio::test(start_paused = true)]
async fn response_telemetry_recalibrates_the_budget() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    model.script(
        "A",
        [Step::ReplyWith(RateLimitSnapshot { remaining_tokens: Some(10), ..Default::default() })],
    );
    let (queue, sink) = queue_with_sink(&model, &clock);

    queue.generate_text(prompt("A", 100), None).await.unwrap();
    assert_eq!(queue.budget().await.unwrap().tokens(), 10);
    assert!(sink.events().contains(&QueueEvent::BudgetRecalibrated {
        model_key: "m".into(),
        available_tokens: 10,
        reset_in: None,
    }));

    // B no longer fits until the budget refills (90 tokens at 1500/min, 60 ms).
    let start = tokio::time::Instant::now();
    queue.generate_text(prompt("B", 100), None).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(60));
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_band_recalibration_holds_until_reset() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let (queue, _sink) = queue_with_sink(&model, &clock);

    queue
        .recalibrate(RateLimitSnapshot {
            remaining_tokens: Some(0),
            remaining_requests: None,
            retry_after: Some(Duration::from_secs(5)),
        })
        .await;
    assert_eq!(queue.budget().await.unwrap().tokens(), 0);

    let start = tokio::time::Instant::now();
    queue.generate_text(prompt("A", 100), None).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_are_emitted_in_order() {
    let clock = TokioClock::new();
    let model = FakeModel::new();
    let (queue, sink) = queue_with_sink(&model, &clock);

    let handle = queue.submit_as("alice", Method::GenerateObject, prompt("A", 42), None).await.unwrap();
    let id = handle.request_id();
    handle.await.unwrap();

    let events: Vec<QueueEvent> =
        sink.events().into_iter().filter(|e| e.request_id() == Some(id)).collect();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        events[0],
        QueueEvent::Enqueued { method: Method::GenerateObject, token_count: 42, .. }
    ));
    assert!(matches!(events[1], QueueEvent::Dispatched { token_count: 42, .. }));
    assert!(matches!(events[2], QueueEvent::Settled { status: RequestStatus::Delivered, .. }));
    queue.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn gate_logs_admission_with_structured_fields() {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let clock = TokioClock::new();
    let model = FakeModel::new();
    let (queue, _sink) = queue_with_sink(&model, &clock);
    let handle = queue.submit(Method::GenerateText, prompt("A", 7), None).await.unwrap();
    let id = handle.request_id();
    handle.await.unwrap();
    queue.dispose().await;

    let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("lmqueue::gate"));
    assert!(logs.contains("request admitted"));
    assert!(logs.contains(&format!("request_id={id}")));
    assert!(logs.contains("token_count=7"));
    assert!(logs.contains("lmqueue::telemetry"));
}
