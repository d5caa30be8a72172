//! Seams to the external provider: the model call itself and token estimation.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::budget::RateLimitSnapshot;
use crate::request::Method;

/// How the queue should treat a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider rejected the call for rate limiting. `retry_after` is its hint, if any.
    RateLimited { retry_after: Option<Duration> },
    /// Anything else; surfaced to the caller unchanged.
    Other,
}

/// The external language-model provider.
///
/// The queue never inspects payloads or responses; it only needs the telemetry hooks.
/// For streaming methods `Response` is whatever handle the provider returns for the stream;
/// the request settles when `call` returns it.
///
/// ```rust
/// use async_trait::async_trait;
/// use lmqueue::{LanguageModel, Method};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug)]
/// struct Echo;
///
/// #[async_trait]
/// impl LanguageModel for Echo {
///     type Payload = String;
///     type Response = String;
///     type Error = std::io::Error;
///
///     async fn call(
///         &self,
///         _method: Method,
///         payload: &String,
///         _cancel: CancellationToken,
///     ) -> Result<String, std::io::Error> {
///         Ok(payload.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Response: Send + 'static;
    type Error: Send + 'static;

    /// Perform the call. Implementations should stop work promptly when `cancel` fires.
    async fn call(
        &self,
        method: Method,
        payload: &Self::Payload,
        cancel: CancellationToken,
    ) -> Result<Self::Response, Self::Error>;

    /// Rate-limit telemetry carried by a successful response.
    fn response_telemetry(&self, _response: &Self::Response) -> Option<RateLimitSnapshot> {
        None
    }

    fn classify_error(&self, _error: &Self::Error) -> FailureKind {
        FailureKind::Other
    }
}

/// Estimates the token cost of a payload. Called once per request, at enqueue time.
pub trait TokenEstimator<P: ?Sized>: Send + Sync {
    fn estimate(&self, payload: &P) -> u64;
}

impl<P: ?Sized, F> TokenEstimator<P> for F
where
    F: Fn(&P) -> u64 + Send + Sync,
{
    fn estimate(&self, payload: &P) -> u64 {
        self(payload)
    }
}

/// Character-count heuristic for text payloads: `ceil(chars / chars_per_token) + overhead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharsPerToken {
    chars_per_token: u32,
    overhead: u64,
}

impl CharsPerToken {
    /// `chars_per_token` of zero is treated as one.
    pub fn new(chars_per_token: u32) -> Self {
        Self { chars_per_token: chars_per_token.max(1), overhead: 0 }
    }

    /// Fixed per-message overhead (role markers, formatting).
    pub fn with_overhead(mut self, overhead: u64) -> Self {
        self.overhead = overhead;
        self
    }
}

impl Default for CharsPerToken {
    fn default() -> Self {
        Self::new(4)
    }
}

impl<P: AsRef<str> + ?Sized> TokenEstimator<P> for CharsPerToken {
    fn estimate(&self, payload: &P) -> u64 {
        let chars = payload.as_ref().chars().count() as u64;
        chars.div_ceil(u64::from(self.chars_per_token)).saturating_add(self.overhead)
    }
}
