//! JSONL sink for `lmqueue`. Appends one queue event per line.
//! Always writes; bring your own path.

use lmqueue::telemetry::{event_to_json, QueueEvent, TelemetrySink};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), io::Error>> + Send>>;

/// Appends events to a file as newline-delimited JSON.
///
/// Clones share one write lock so lines from concurrent queue tasks never interleave.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: Arc::new(path.into()), lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One JSON line for `event`, newline included.
pub fn encode_line(event: &QueueEvent) -> String {
    let mut line = event_to_json(event).to_string();
    line.push('\n');
    line
}

impl tower_service::Service<QueueEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QueueEvent) -> Self::Future {
        let path = self.path.clone();
        let lock = self.lock.clone();
        let line = encode_line(&event);
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let _guard = lock.lock().await;
            let result = async {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path.as_path())
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = &result {
                tracing::warn!(
                    target: "lmqueue::jsonl",
                    path = %path.display(),
                    error = %e,
                    "failed to append queue event"
                );
            }
            result
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
    type SinkFuture = SinkFuture;
}
