//! Request identity, lifecycle status, and the shared request record.
//!
//! A queued call is split in two. The [`RequestRecord`] is the part every cooperating queue
//! instance can see through the store: identity, cost, ordering timestamps, and ownership.
//! The payload, the caller's result channel, and the cancellation token stay with the
//! instance that enqueued the request (its `origin`).

use std::fmt;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Opaque unique identifier assigned to a request at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one cooperating queue instance (usually one per process per model).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct InstanceId(String);

impl InstanceId {
    /// Use an explicit identifier (hostname, pod name, ...).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for ad-hoc instances.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of provider call a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "kebab-case"))]
pub enum Method {
    /// Single text completion.
    GenerateText,
    /// Completion constrained to a structured object.
    #[cfg_attr(feature = "serde", serde(rename = "generate-structured-object"))]
    GenerateObject,
    /// Streaming text completion.
    StreamText,
    /// Streaming structured object.
    #[cfg_attr(feature = "serde", serde(rename = "stream-structured-object"))]
    StreamObject,
}

impl Method {
    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GenerateText => "generate-text",
            Method::GenerateObject => "generate-structured-object",
            Method::StreamText => "stream-text",
            Method::StreamObject => "stream-structured-object",
        }
    }

    /// Whether the response is delivered incrementally.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Method::StreamText | Method::StreamObject)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a request.
///
/// Transitions are monotonic (`Pending` → `Processing` → terminal) except for the single
/// rate-limit retry and lease reclamation, both of which move `Processing` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum RequestStatus {
    Pending,
    Processing,
    Delivered,
    Aborted,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Delivered | RequestStatus::Aborted | RequestStatus::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Delivered => "delivered",
            RequestStatus::Aborted => "aborted",
            RequestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Shared record of one queued or in-flight request.
///
/// Timestamps are milliseconds from the queue's [`Clock`](crate::Clock); every instance
/// sharing a store must use clocks with the same origin.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RequestRecord {
    pub id: RequestId,
    pub model_key: String,
    pub method: Method,
    /// Estimated cost, fixed at enqueue time.
    pub token_count: u64,
    pub requester_id: Option<String>,
    pub status: RequestStatus,
    pub queued_at: u64,
    pub processing_started_at: Option<u64>,
    /// Set only while `status == Processing`.
    pub claimed_by: Option<InstanceId>,
    /// Instance that enqueued the request and holds its payload.
    pub origin: InstanceId,
    pub lease_renewed_at: Option<u64>,
    pub rate_limit_retries: u32,
}

impl RequestRecord {
    /// New `Pending` record.
    pub fn pending(
        model_key: impl Into<String>,
        method: Method,
        token_count: u64,
        origin: InstanceId,
        queued_at: u64,
    ) -> Self {
        Self {
            id: RequestId::new(),
            model_key: model_key.into(),
            method,
            token_count,
            requester_id: None,
            status: RequestStatus::Pending,
            queued_at,
            processing_started_at: None,
            claimed_by: None,
            origin,
            lease_renewed_at: None,
            rate_limit_retries: 0,
        }
    }

    /// Attach the owning caller/user for observability.
    pub fn with_requester(mut self, requester_id: impl Into<String>) -> Self {
        self.requester_id = Some(requester_id.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == RequestStatus::Processing
    }

    /// Millisecond timestamp after which the current claim is considered abandoned.
    pub fn lease_expires_at(&self, lease_millis: u64) -> Option<u64> {
        if !self.is_processing() {
            return None;
        }
        self.lease_renewed_at
            .or(self.processing_started_at)
            .map(|start| start.saturating_add(lease_millis))
    }
}
