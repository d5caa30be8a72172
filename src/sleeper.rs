//! How the gate loop waits.
//!
//! Between admission passes the gate races a [`Sleeper`] against its wake-up signal, and it
//! backs off store failures through the same sleeper. Tests swap it to observe those waits.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// `tokio::time::sleep`. Honors paused test time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Yields once and returns. A gate driven by it re-polls the store as fast as the runtime
/// lets it, so use it only with a wake-heavy workload or in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> SleepFuture {
        Box::pin(tokio::task::yield_now())
    }
}

/// Records each requested wait, then sleeps on tokio time.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    fn waits(&self) -> std::sync::MutexGuard<'_, Vec<Duration>> {
        self.waits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requested waits in order, including ones cut short by a wake-up.
    pub fn calls(&self) -> Vec<Duration> {
        self.waits().clone()
    }

    /// Sum of requested waits.
    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }

    pub fn clear(&self) {
        self.waits().clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        self.waits().push(duration);
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn instant_sleeper_does_not_advance_time() {
        let start = Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_sleeper_records_and_sums() {
        let sleeper = TrackingSleeper::new();
        let start = Instant::now();

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(250)).await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(250)]);
        assert_eq!(sleeper.total(), Duration::from_millis(350));
        assert_eq!(start.elapsed(), Duration::from_millis(350));

        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_as_trait_object() {
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let start = Instant::now();
        sleeper.sleep(Duration::from_secs(3)).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
