//! Per-model token budget.
//!
//! The budget has two layers:
//! - a locally **projected** value that refills toward the per-minute ceiling as time passes
//!   (continuously for [`RefillMode::Linear`], in whole one-minute windows for
//!   [`RefillMode::Window`]);
//! - an **authoritative** override applied whenever the provider reports rate-limit telemetry.
//!   The override replaces the projection outright. If it carries a reset hint the budget is
//!   held at that value until `reset_at`, after which it resets to the ceiling.
//!
//! All methods are pure: callers pass `now` (milliseconds from the queue clock) and persist
//! the result through a [`QueueStore`](crate::store::QueueStore), which is what makes the
//! read-modify-write atomic across instances.
//!
//! ```rust
//! use lmqueue::budget::{BudgetPolicy, TokenBudget};
//!
//! let policy = BudgetPolicy::per_minute(6_000);
//! let mut budget = TokenBudget::full(&policy, 0);
//! budget.consume(6_000, false);
//! // 1 second later, 1/60th of the ceiling has been refilled.
//! assert_eq!(budget.project(&policy, 1_000).tokens(), 100);
//! ```

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Length of a rate-limit window.
pub const WINDOW_MILLIS: u64 = 60_000;

/// How the projected budget refills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum RefillMode {
    /// Continuous refill at `tokens_per_minute / 60_000` tokens per millisecond.
    #[default]
    Linear,
    /// Full reset at the end of each one-minute window.
    Window,
}

/// Ceilings the projected budget refills toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BudgetPolicy {
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u64>,
    pub refill: RefillMode,
}

impl BudgetPolicy {
    /// Linear refill, no request ceiling.
    pub fn per_minute(tokens_per_minute: u64) -> Self {
        Self { tokens_per_minute, requests_per_minute: None, refill: RefillMode::Linear }
    }

    pub fn with_requests_per_minute(mut self, requests_per_minute: u64) -> Self {
        self.requests_per_minute = Some(requests_per_minute);
        self
    }

    pub fn with_refill(mut self, refill: RefillMode) -> Self {
        self.refill = refill;
        self
    }

    fn tokens_per_milli(&self) -> f64 {
        self.tokens_per_minute as f64 / WINDOW_MILLIS as f64
    }

    fn requests_per_milli(&self) -> Option<f64> {
        self.requests_per_minute.map(|rpm| rpm as f64 / WINDOW_MILLIS as f64)
    }
}

/// Rate-limit telemetry reported by the provider alongside a response or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitSnapshot {
    pub remaining_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub retry_after: Option<Duration>,
}

const REMAINING_TOKENS_HEADERS: &[&str] =
    &["x-ratelimit-remaining-tokens", "anthropic-ratelimit-tokens-remaining"];
const REMAINING_REQUESTS_HEADERS: &[&str] =
    &["x-ratelimit-remaining-requests", "anthropic-ratelimit-requests-remaining"];

impl RateLimitSnapshot {
    /// Parse provider response headers. Header names are matched case-insensitively.
    ///
    /// Recognizes the OpenAI-style `x-ratelimit-remaining-*` family, the Anthropic
    /// `anthropic-ratelimit-*-remaining` family, `retry-after-ms` and `retry-after`
    /// (delay-seconds form only). Returns `None` when no header carried telemetry.
    pub fn from_headers<I, K, V>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut snapshot = Self::default();
        let mut retry_after_ms = None;
        let mut retry_after_secs = None;

        for (name, value) in headers {
            let name = name.as_ref().trim().to_ascii_lowercase();
            let value = value.as_ref().trim();
            if REMAINING_TOKENS_HEADERS.contains(&name.as_str()) {
                snapshot.remaining_tokens = value.parse().ok().or(snapshot.remaining_tokens);
            } else if REMAINING_REQUESTS_HEADERS.contains(&name.as_str()) {
                snapshot.remaining_requests = value.parse().ok().or(snapshot.remaining_requests);
            } else if name == "retry-after-ms" {
                retry_after_ms = parse_non_negative(value).map(|ms| Duration::from_secs_f64(ms / 1000.0));
            } else if name == "retry-after" {
                retry_after_secs = parse_non_negative(value).map(Duration::from_secs_f64);
            }
        }
        // The millisecond header is more precise when both are present.
        snapshot.retry_after = retry_after_ms.or(retry_after_secs);

        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_tokens.is_none()
            && self.remaining_requests.is_none()
            && self.retry_after.is_none()
    }
}

fn parse_non_negative(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// A mutation applied atomically by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetUpdate {
    /// Spend tokens outside a claim.
    Consume { tokens: u64 },
    /// Return tokens for work that never reached the provider.
    Refund { tokens: u64 },
    /// Authoritative telemetry from a completed call.
    Snapshot(RateLimitSnapshot),
    /// The provider rejected a call for rate limiting: zero availability until `retry_after`.
    RateLimited { retry_after: Duration },
}

/// Remaining throughput allowance for one model key.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TokenBudget {
    pub available_tokens: f64,
    pub available_requests: Option<f64>,
    pub last_updated: u64,
    /// While set and in the future, the budget is held; at `reset_at` it resets to the ceiling.
    pub reset_at: Option<u64>,
}

impl TokenBudget {
    /// A budget at its ceiling.
    pub fn full(policy: &BudgetPolicy, now: u64) -> Self {
        Self {
            available_tokens: policy.tokens_per_minute as f64,
            available_requests: policy.requests_per_minute.map(|r| r as f64),
            last_updated: now,
            reset_at: match policy.refill {
                RefillMode::Linear => None,
                RefillMode::Window => Some(now.saturating_add(WINDOW_MILLIS)),
            },
        }
    }

    /// Whole tokens available.
    pub fn tokens(&self) -> u64 {
        if self.available_tokens <= 0.0 {
            0
        } else {
            self.available_tokens.floor() as u64
        }
    }

    /// Whole requests available, when a request ceiling is configured.
    pub fn requests(&self) -> Option<u64> {
        self.available_requests.map(|r| if r <= 0.0 { 0 } else { r.floor() as u64 })
    }

    /// The budget as it stands at `now`, with refill and resets applied.
    pub fn project(&self, policy: &BudgetPolicy, now: u64) -> Self {
        let mut next = *self;

        if policy.refill == RefillMode::Window && next.reset_at.is_none() {
            next.reset_at = Some(next.last_updated.saturating_add(WINDOW_MILLIS));
        }

        if let Some(reset_at) = next.reset_at {
            if now < reset_at {
                return next;
            }
            next.available_tokens = policy.tokens_per_minute as f64;
            next.available_requests = policy.requests_per_minute.map(|r| r as f64);
            next.last_updated = now;
            next.reset_at = match policy.refill {
                RefillMode::Linear => None,
                RefillMode::Window => {
                    let windows = (now - reset_at) / WINDOW_MILLIS + 1;
                    Some(reset_at.saturating_add(windows.saturating_mul(WINDOW_MILLIS)))
                }
            };
            return next;
        }

        // Linear refill; clocks that step backwards refill nothing.
        let elapsed = now.saturating_sub(next.last_updated) as f64;
        let ceiling = policy.tokens_per_minute as f64;
        if next.available_tokens < ceiling {
            next.available_tokens =
                (next.available_tokens + elapsed * policy.tokens_per_milli()).min(ceiling);
        }
        if let (Some(requests), Some(rate), Some(rpm)) =
            (next.available_requests, policy.requests_per_milli(), policy.requests_per_minute)
        {
            let ceiling = rpm as f64;
            if requests < ceiling {
                next.available_requests = Some((requests + elapsed * rate).min(ceiling));
            }
        }
        next.last_updated = next.last_updated.max(now);
        next
    }

    /// Spend tokens (and one request slot when `count_request`). Never drops below zero.
    pub fn consume(&mut self, tokens: u64, count_request: bool) {
        self.available_tokens = (self.available_tokens - tokens as f64).max(0.0);
        if count_request {
            if let Some(requests) = self.available_requests.as_mut() {
                *requests = (*requests - 1.0).max(0.0);
            }
        }
    }

    /// Return tokens and one request slot, capped at the ceiling.
    pub fn refund(&mut self, tokens: u64, policy: &BudgetPolicy) {
        let ceiling = policy.tokens_per_minute as f64;
        self.available_tokens = (self.available_tokens + tokens as f64).min(ceiling.max(self.available_tokens));
        if let (Some(requests), Some(rpm)) = (self.available_requests.as_mut(), policy.requests_per_minute) {
            *requests = (*requests + 1.0).min(rpm as f64);
        }
    }

    /// Project to `now`, then apply `update`.
    pub fn apply(&self, update: &BudgetUpdate, policy: &BudgetPolicy, now: u64) -> Self {
        let mut next = self.project(policy, now);
        match update {
            BudgetUpdate::Consume { tokens } => next.consume(*tokens, false),
            BudgetUpdate::Refund { tokens } => next.refund(*tokens, policy),
            BudgetUpdate::Snapshot(snapshot) => {
                if let Some(remaining) = snapshot.remaining_tokens {
                    next.available_tokens = remaining as f64;
                }
                if let (Some(remaining), Some(_)) =
                    (snapshot.remaining_requests, policy.requests_per_minute)
                {
                    next.available_requests = Some(remaining as f64);
                }
                if let Some(retry_after) = snapshot.retry_after {
                    next.reset_at = Some(now.saturating_add(millis(retry_after)));
                }
                next.last_updated = now;
            }
            BudgetUpdate::RateLimited { retry_after } => {
                next.available_tokens = 0.0;
                if next.available_requests.is_some() {
                    next.available_requests = Some(0.0);
                }
                next.reset_at = Some(now.saturating_add(millis(*retry_after)));
                next.last_updated = now;
            }
        }
        next
    }

    /// How long until `tokens` (and one request slot) become available, assuming `self` is
    /// already projected to `now`. `None` when the budget cannot refill.
    pub fn wait_for(&self, tokens: u64, policy: &BudgetPolicy, now: u64) -> Option<Duration> {
        if let Some(reset_at) = self.reset_at {
            return Some(Duration::from_millis(reset_at.saturating_sub(now)));
        }

        let token_deficit = tokens as f64 - self.available_tokens;
        let mut wait_ms: f64 = 0.0;
        if token_deficit > 0.0 {
            let rate = policy.tokens_per_milli();
            if rate <= 0.0 {
                return None;
            }
            wait_ms = token_deficit / rate;
        }
        if let (Some(requests), Some(rate)) = (self.available_requests, policy.requests_per_milli()) {
            let deficit = 1.0 - requests;
            if deficit > 0.0 {
                if rate <= 0.0 {
                    return None;
                }
                wait_ms = wait_ms.max(deficit / rate);
            }
        }
        Some(Duration::from_millis(wait_ms.ceil() as u64))
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
