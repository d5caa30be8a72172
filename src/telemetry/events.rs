use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

use crate::request::{Method, RequestId, RequestStatus};

/// Structured events emitted by a queue instance.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A request joined the tail of the queue.
    Enqueued { request_id: RequestId, model_key: String, method: Method, token_count: u64 },
    /// A request exceeded the single-message ceiling and was never queued.
    Rejected { model_key: String, token_count: u64, max_tokens: u64 },
    /// A request was admitted and handed to the provider.
    Dispatched { request_id: RequestId, model_key: String, token_count: u64, waited: Duration },
    /// A request reached a terminal status.
    Settled { request_id: RequestId, model_key: String, status: RequestStatus, elapsed: Duration },
    /// The provider rate-limited a call. `requeued` is false once the retry is spent.
    RateLimited { request_id: RequestId, model_key: String, retry_after: Duration, requeued: bool },
    /// Provider telemetry replaced the projected budget.
    BudgetRecalibrated { model_key: String, available_tokens: u64, reset_in: Option<Duration> },
    /// Expired claims were reset or orphaned records dropped.
    Reclaimed { model_key: String, reclaimed: usize, pruned: usize },
}

impl QueueEvent {
    pub fn model_key(&self) -> &str {
        match self {
            QueueEvent::Enqueued { model_key, .. }
            | QueueEvent::Rejected { model_key, .. }
            | QueueEvent::Dispatched { model_key, .. }
            | QueueEvent::Settled { model_key, .. }
            | QueueEvent::RateLimited { model_key, .. }
            | QueueEvent::BudgetRecalibrated { model_key, .. }
            | QueueEvent::Reclaimed { model_key, .. } => model_key,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            QueueEvent::Enqueued { request_id, .. }
            | QueueEvent::Dispatched { request_id, .. }
            | QueueEvent::Settled { request_id, .. }
            | QueueEvent::RateLimited { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Enqueued { request_id, model_key, method, token_count } => write!(
                f,
                "Enqueued({}, model={}, method={}, tokens={})",
                request_id, model_key, method, token_count
            ),
            QueueEvent::Rejected { model_key, token_count, max_tokens } => write!(
                f,
                "Rejected(model={}, tokens={}/{})",
                model_key, token_count, max_tokens
            ),
            QueueEvent::Dispatched { request_id, model_key, token_count, waited } => write!(
                f,
                "Dispatched({}, model={}, tokens={}, waited={:?})",
                request_id, model_key, token_count, waited
            ),
            QueueEvent::Settled { request_id, model_key, status, elapsed } => write!(
                f,
                "Settled({}, model={}, status={}, elapsed={:?})",
                request_id, model_key, status, elapsed
            ),
            QueueEvent::RateLimited { request_id, model_key, retry_after, requeued } => write!(
                f,
                "RateLimited({}, model={}, retry_after={:?}, requeued={})",
                request_id, model_key, retry_after, requeued
            ),
            QueueEvent::BudgetRecalibrated { model_key, available_tokens, reset_in } => {
                write!(f, "BudgetRecalibrated(model={}, tokens={}", model_key, available_tokens)?;
                if let Some(reset_in) = reset_in {
                    write!(f, ", reset_in={:?}", reset_in)?;
                }
                write!(f, ")")
            }
            QueueEvent::Reclaimed { model_key, reclaimed, pruned } => write!(
                f,
                "Reclaimed(model={}, reclaimed={}, pruned={})",
                model_key, reclaimed, pruned
            ),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a QueueEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &QueueEvent) -> serde_json::Value {
    match event {
        QueueEvent::Enqueued { request_id, model_key, method, token_count } => json!({
            "kind": "enqueued",
            "request_id": request_id.to_string(),
            "model_key": model_key,
            "method": method.as_str(),
            "token_count": *token_count,
        }),
        QueueEvent::Rejected { model_key, token_count, max_tokens } => json!({
            "kind": "rejected",
            "model_key": model_key,
            "token_count": *token_count,
            "max_tokens": *max_tokens,
        }),
        QueueEvent::Dispatched { request_id, model_key, token_count, waited } => json!({
            "kind": "dispatched",
            "request_id": request_id.to_string(),
            "model_key": model_key,
            "token_count": *token_count,
            "waited_ms": clamp_u64(waited.as_millis()),
        }),
        QueueEvent::Settled { request_id, model_key, status, elapsed } => json!({
            "kind": "settled",
            "request_id": request_id.to_string(),
            "model_key": model_key,
            "status": status.to_string(),
            "elapsed_ms": clamp_u64(elapsed.as_millis()),
        }),
        QueueEvent::RateLimited { request_id, model_key, retry_after, requeued } => json!({
            "kind": "rate_limited",
            "request_id": request_id.to_string(),
            "model_key": model_key,
            "retry_after_ms": clamp_u64(retry_after.as_millis()),
            "requeued": *requeued,
        }),
        QueueEvent::BudgetRecalibrated { model_key, available_tokens, reset_in } => json!({
            "kind": "budget_recalibrated",
            "model_key": model_key,
            "available_tokens": *available_tokens,
            "reset_in_ms": reset_in.map(|d| clamp_u64(d.as_millis())),
        }),
        QueueEvent::Reclaimed { model_key, reclaimed, pruned } => json!({
            "kind": "reclaimed",
            "model_key": model_key,
            "reclaimed": *reclaimed,
            "pruned": *pruned,
        }),
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn settled_json() {
        let id = RequestId::new();
        let v = event_to_json(&QueueEvent::Settled {
            request_id: id,
            model_key: "m".into(),
            status: RequestStatus::Delivered,
            elapsed: Duration::from_millis(420),
        });
        assert_eq!(v["kind"], "settled");
        assert_eq!(v["request_id"], id.to_string());
        assert_eq!(v["status"], "delivered");
        assert_eq!(v["elapsed_ms"], 420);
    }

    #[test]
    fn recalibrated_json_without_reset() {
        let v = event_to_json(&QueueEvent::BudgetRecalibrated {
            model_key: "m".into(),
            available_tokens: 12,
            reset_in: None,
        });
        assert_eq!(v["kind"], "budget_recalibrated");
        assert_eq!(v["available_tokens"], 12);
        assert!(v["reset_in_ms"].is_null());
    }

    #[test]
    fn enqueued_json_uses_wire_method_name() {
        let v = event_to_json(&QueueEvent::Enqueued {
            request_id: RequestId::new(),
            model_key: "m".into(),
            method: Method::GenerateObject,
            token_count: 9,
        });
        assert_eq!(v["method"], "generate-structured-object");
    }
}
