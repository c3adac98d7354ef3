//! Usage accounting consumed from the billing collaborator.
//!
//! Reservations make the budget a hard ceiling: tokens are reserved before a
//! call is issued and settled against actual usage afterwards, so concurrent
//! batches can never overshoot the cap together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Per-user cap for one budget period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCap {
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub cost_per_1k_tokens: f64,
}

impl BudgetCap {
    pub fn unlimited() -> Self {
        Self {
            max_tokens: None,
            max_cost_usd: None,
            cost_per_1k_tokens: 0.0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_tokens.is_none() && self.max_cost_usd.is_none()
    }

    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }

    /// Whether usage has reached the cap.
    pub fn is_exhausted(&self, usage: &Usage) -> bool {
        let tokens = usage.committed_tokens + usage.reserved_tokens;
        self.max_tokens.is_some_and(|max| tokens >= max)
            || self.max_cost_usd.is_some_and(|max| self.cost_of(tokens) >= max)
    }

    /// Whether `extra` more tokens fit under the cap.
    pub fn admits(&self, usage: &Usage, extra: u64) -> bool {
        let tokens = usage.committed_tokens + usage.reserved_tokens + extra;
        self.max_tokens.map_or(true, |max| tokens <= max)
            && self.max_cost_usd.map_or(true, |max| self.cost_of(tokens) <= max)
    }
}

/// Usage for one user in one period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub committed_tokens: u64,
    /// Held by in-flight calls
    pub reserved_tokens: u64,
}

/// Tokens held for an in-flight call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    pub period: String,
    pub tokens: u64,
}

/// Budget period key ("YYYY-MM").
pub fn budget_period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Per-user usage ledger.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Current usage for a user in a period.
    async fn usage(&self, user_id: &str, period: &str) -> Result<Usage>;

    /// Atomically reserve tokens if they fit under the cap.
    ///
    /// Returns None (and reserves nothing) when the cap would be exceeded.
    async fn try_reserve(
        &self,
        user_id: &str,
        period: &str,
        tokens: u64,
        cap: &BudgetCap,
    ) -> Result<Option<Reservation>>;

    /// Release a reservation and commit the tokens actually used.
    async fn settle(&self, reservation: Reservation, actual_tokens: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cap_by_tokens_and_cost() {
        let cap = BudgetCap {
            max_tokens: Some(1_000),
            max_cost_usd: Some(0.01),
            cost_per_1k_tokens: 0.02,
        };
        let usage = Usage {
            committed_tokens: 400,
            reserved_tokens: 0,
        };
        // 500 tokens cost exactly $0.01
        assert!(cap.admits(&usage, 100));
        assert!(!cap.admits(&usage, 101));
        assert!(!cap.is_exhausted(&usage));
        assert!(cap.is_exhausted(&Usage {
            committed_tokens: 500,
            reserved_tokens: 0
        }));
    }

    #[test]
    fn test_unlimited_admits_everything() {
        let cap = BudgetCap::unlimited();
        assert!(cap.admits(&Usage::default(), u64::MAX / 2));
        assert!(!cap.is_exhausted(&Usage {
            committed_tokens: u64::MAX / 2,
            reserved_tokens: 0
        }));
    }

    #[test]
    fn test_budget_period_is_monthly() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(budget_period(now), "2026-10");
    }
}
