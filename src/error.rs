//! Error types surfaced by the queue, its stores, and its configuration.
use std::fmt;

use crate::request::RequestId;

/// Error returned to callers of [`LanguageModelQueue`](crate::LanguageModelQueue).
///
/// `E` is the provider's own error type; provider failures pass through unchanged in
/// [`QueueError::Provider`].
#[derive(Debug, Clone)]
pub enum QueueError<E> {
    /// The estimated cost exceeds the model's single-message ceiling. No record was created.
    MessageTooLarge { token_count: u64, max_tokens: u64, model_key: String },
    /// The caller cancelled the request, or the queue was disposed while it was outstanding.
    Aborted { request_id: RequestId },
    /// The queue was disposed before the call was made.
    Disposed { model_key: String },
    /// The shared store failed while enqueueing.
    Store(StoreError),
    /// The provider call failed.
    Provider(E),
}

impl<E: fmt::Display> fmt::Display for QueueError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge { token_count, max_tokens, model_key } => write!(
                f,
                "message of {} tokens exceeds the {} token limit of model {}",
                token_count, max_tokens, model_key
            ),
            Self::Aborted { request_id } => write!(f, "request {} was aborted", request_id),
            Self::Disposed { model_key } => write!(f, "queue for model {} is disposed", model_key),
            Self::Store(e) => write!(f, "queue store failure: {}", e),
            Self::Provider(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for QueueError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Provider(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<StoreError> for QueueError<E> {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl<E> QueueError<E> {
    pub fn is_message_too_large(&self) -> bool {
        matches!(self, Self::MessageTooLarge { .. })
    }

    /// Check if the request was aborted (cancelled or disposed while outstanding).
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider(_))
    }

    /// Id of the aborted request.
    pub fn aborted_request(&self) -> Option<RequestId> {
        match self {
            Self::Aborted { request_id } => Some(*request_id),
            _ => None,
        }
    }

    /// `(token_count, max_tokens)` for an oversized message.
    pub fn size_details(&self) -> Option<(u64, u64)> {
        match self {
            Self::MessageTooLarge { token_count, max_tokens, .. } => Some((*token_count, *max_tokens)),
            _ => None,
        }
    }

    /// Borrow the provider error if present.
    pub fn as_provider(&self) -> Option<&E> {
        match self {
            Self::Provider(e) => Some(e),
            _ => None,
        }
    }

    /// Take the provider error if present.
    pub fn into_provider(self) -> Option<E> {
        match self {
            Self::Provider(e) => Some(e),
            _ => None,
        }
    }

    /// Convert the provider error type, leaving other variants intact.
    pub fn map_provider<F, E2>(self, f: F) -> QueueError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::MessageTooLarge { token_count, max_tokens, model_key } => {
                QueueError::MessageTooLarge { token_count, max_tokens, model_key }
            }
            Self::Aborted { request_id } => QueueError::Aborted { request_id },
            Self::Disposed { model_key } => QueueError::Disposed { model_key },
            Self::Store(e) => QueueError::Store(e),
            Self::Provider(e) => QueueError::Provider(f(e)),
        }
    }
}

/// Failure of a [`QueueStore`](crate::store::QueueStore) operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Optimistic updates kept losing the race for `key`.
    #[error("contention on {key}: gave up after {attempts} attempts")]
    Contention { key: String, attempts: usize },
    /// The backend itself failed (connection, protocol, script error).
    #[error("backend error: {0}")]
    Backend(String),
    /// Stored state could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn codec(err: impl fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Invalid [`ModelLimits`](crate::ModelLimits) or [`QueueConfig`](crate::QueueConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("model key must not be empty")]
    EmptyModelKey,
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max_tokens_per_message ({max_tokens}) exceeds tokens_per_minute ({tokens_per_minute}); such messages could never be admitted")]
    MessageExceedsRate { max_tokens: u64, tokens_per_minute: u64 },
    #[error("{field} must be at least {min_ms}ms")]
    TooShort { field: &'static str, min_ms: u64 },
    /// The queue builder was not given a token estimator.
    #[error("a token estimator is required")]
    MissingEstimator,
}
