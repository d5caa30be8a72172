//! Head-of-line admission decision.

use std::fmt;
use std::time::Duration;

use crate::budget::{BudgetPolicy, TokenBudget};

/// Why the head-of-line request cannot be dispatched yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockReason {
    /// The concurrency ceiling is reached; a settlement frees a slot.
    Concurrency { processing: usize, max: usize },
    /// Not enough tokens left in the budget.
    Tokens { needed: u64, available: u64 },
    /// The requests-per-minute allowance is exhausted.
    Requests,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Concurrency { processing, max } => {
                write!(f, "concurrency limit reached ({}/{})", processing, max)
            }
            BlockReason::Tokens { needed, available } => {
                write!(f, "needs {} tokens, {} available", needed, available)
            }
            BlockReason::Requests => f.write_str("request allowance exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit,
    /// `retry_in` is how long until the blocking condition clears on its own, when time alone
    /// can clear it.
    Blocked { reason: BlockReason, retry_in: Option<Duration> },
}

impl Admission {
    pub fn is_admit(&self) -> bool {
        matches!(self, Admission::Admit)
    }
}

/// Decide whether a request costing `token_count` may start now.
///
/// `budget` must already be projected to `now`.
pub fn evaluate(
    token_count: u64,
    processing: usize,
    max_concurrent: usize,
    budget: &TokenBudget,
    policy: &BudgetPolicy,
    now: u64,
) -> Admission {
    if processing >= max_concurrent {
        return Admission::Blocked {
            reason: BlockReason::Concurrency { processing, max: max_concurrent },
            retry_in: None,
        };
    }
    if budget.available_tokens < token_count as f64 {
        return Admission::Blocked {
            reason: BlockReason::Tokens { needed: token_count, available: budget.tokens() },
            retry_in: budget.wait_for(token_count, policy, now),
        };
    }
    if budget.available_requests.is_some_and(|r| r < 1.0) {
        return Admission::Blocked {
            reason: BlockReason::Requests,
            retry_in: budget.wait_for(0, policy, now),
        };
    }
    Admission::Admit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetUpdate;

    #[test]
    fn admits_when_everything_fits() {
        let policy = BudgetPolicy::per_minute(1_000);
        let budget = TokenBudget::full(&policy, 0);
        assert!(evaluate(1_000, 0, 1, &budget, &policy, 0).is_admit());
    }

    #[test]
    fn concurrency_blocks_without_time_hint() {
        let policy = BudgetPolicy::per_minute(1_000);
        let budget = TokenBudget::full(&policy, 0);
        assert_eq!(
            evaluate(1, 2, 2, &budget, &policy, 0),
            Admission::Blocked {
                reason: BlockReason::Concurrency { processing: 2, max: 2 },
                retry_in: None
            }
        );
    }

    #[test]
    fn token_deficit_reports_refill_time() {
        let policy = BudgetPolicy::per_minute(60_000);
        let mut budget = TokenBudget::full(&policy, 0);
        budget.consume(59_900, false);
        match evaluate(300, 0, 4, &budget, &policy, 0) {
            Admission::Blocked { reason, retry_in } => {
                assert_eq!(reason, BlockReason::Tokens { needed: 300, available: 100 });
                assert_eq!(retry_in, Some(Duration::from_millis(200)));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn held_budget_reports_reset() {
        let policy = BudgetPolicy::per_minute(60_000).with_requests_per_minute(10);
        let budget = TokenBudget::full(&policy, 0).apply(
            &BudgetUpdate::RateLimited { retry_after: Duration::from_secs(2) },
            &policy,
            0,
        );
        match evaluate(1, 0, 1, &budget, &policy, 500) {
            Admission::Blocked { retry_in, .. } => {
                assert_eq!(retry_in, Some(Duration::from_millis(1_500)))
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn request_allowance_blocks() {
        let policy = BudgetPolicy::per_minute(60_000).with_requests_per_minute(1);
        let mut budget = TokenBudget::full(&policy, 0);
        budget.consume(1, true);
        assert!(matches!(
            evaluate(1, 0, 1, &budget, &policy, 0),
            Admission::Blocked { reason: BlockReason::Requests, retry_in: Some(_) }
        ));
    }
}
