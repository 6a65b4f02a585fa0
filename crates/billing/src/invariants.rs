//! Billing invariants.
//!
//! Runnable consistency checks for the billing core, safe to run after any
//! mutation or webhook replay.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use arbor_shared::types::FREE_TIER_TOKEN_LIMIT;

use crate::error::BillingResult;

/// Tolerance when comparing stored and recomputed USD amounts.
const AMOUNT_EPSILON: f64 = 1e-6;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Users affected.
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - the system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of a full invariant sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveCyclesRow {
    user_id: Uuid,
    cycle_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverageMismatchRow {
    cycle_id: Uuid,
    user_id: Uuid,
    token_cost: f64,
    included_credit: f64,
    overage_amount: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct CycleOutOfPeriodRow {
    cycle_id: Uuid,
    user_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    sub_period_start: OffsetDateTime,
    sub_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckExpiredCycleRow {
    cycle_id: Uuid,
    user_id: Uuid,
    period_end: OffsetDateTime,
    overage_amount: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct FreeTierLockRow {
    conversation_id: Uuid,
    user_id: Uuid,
    tokens_used: i64,
    locked: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BadPeriodRow {
    subscription_id: Uuid,
    user_id: Uuid,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
}

/// Service running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_cycle().await?);
        violations.extend(self.check_overage_matches_ledger().await?);
        violations.extend(self.check_cycle_within_subscription_period().await?);
        violations.extend(self.check_expired_cycles_not_stuck().await?);
        violations.extend(self.check_free_tier_lock_consistency().await?);
        violations.extend(self.check_subscription_periods_ordered().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one active billing cycle per user.
    ///
    /// Two active cycles would split usage accounting and double-invoice
    /// the same period. The partial unique index should make this
    /// impossible; a hit here means the index is missing or was bypassed.
    async fn check_single_active_cycle(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveCyclesRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as cycle_count
            FROM billing_cycles
            WHERE status = 'active'
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_cycle".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active billing cycles (expected at most 1)",
                    row.cycle_count
                ),
                context: serde_json::json!({
                    "cycle_count": row.cycle_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: `overage_amount == max(0, token_cost - included_credit)`.
    ///
    /// Must hold after every usage-recording mutation; the overage is what
    /// gets invoiced, so drift here is charging the wrong amount.
    async fn check_overage_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverageMismatchRow> = sqlx::query_as(
            r#"
            SELECT id as cycle_id, user_id, token_cost, included_credit, overage_amount
            FROM billing_cycles
            WHERE ABS(overage_amount - GREATEST(0, token_cost - included_credit)) > $1
            "#,
        )
        .bind(AMOUNT_EPSILON)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "overage_matches_ledger".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Cycle {} has overage {} but cost {} against credit {}",
                    row.cycle_id, row.overage_amount, row.token_cost, row.included_credit
                ),
                context: serde_json::json!({
                    "cycle_id": row.cycle_id,
                    "token_cost": row.token_cost,
                    "included_credit": row.included_credit,
                    "overage_amount": row.overage_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: an active cycle's bounds lie within its subscription's
    /// current period.
    ///
    /// A cycle outside the period should have been rolled over by usage
    /// recording or a renewal reset.
    async fn check_cycle_within_subscription_period(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CycleOutOfPeriodRow> = sqlx::query_as(
            r#"
            SELECT
                c.id as cycle_id,
                c.user_id,
                c.period_start,
                c.period_end,
                s.current_period_start as sub_period_start,
                s.current_period_end as sub_period_end
            FROM billing_cycles c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.status = 'active'
              AND s.status = 'active'
              AND (c.period_start < s.current_period_start
                   OR c.period_end > s.current_period_end)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cycle_within_subscription_period".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active cycle {} spans {} to {} outside subscription period {} to {}",
                    row.cycle_id,
                    row.period_start,
                    row.period_end,
                    row.sub_period_start,
                    row.sub_period_end
                ),
                context: serde_json::json!({
                    "cycle_id": row.cycle_id,
                    "cycle_period_start": row.period_start.to_string(),
                    "cycle_period_end": row.period_end.to_string(),
                    "subscription_period_start": row.sub_period_start.to_string(),
                    "subscription_period_end": row.sub_period_end.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: expired cycles do not stay active for long.
    ///
    /// The hourly invoicing run should settle or retry them; a cycle still
    /// active a day past its period end means the batch is failing
    /// repeatedly or not running.
    async fn check_expired_cycles_not_stuck(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckExpiredCycleRow> = sqlx::query_as(
            r#"
            SELECT id as cycle_id, user_id, period_end, overage_amount
            FROM billing_cycles
            WHERE status = 'active'
              AND period_end < NOW() - INTERVAL '24 hours'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_cycles_not_stuck".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Cycle {} expired at {} but is still active",
                    row.cycle_id, row.period_end
                ),
                context: serde_json::json!({
                    "cycle_id": row.cycle_id,
                    "period_end": row.period_end.to_string(),
                    "overage_amount": row.overage_amount,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: the free-tier lock flag agrees with the ceiling.
    async fn check_free_tier_lock_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FreeTierLockRow> = sqlx::query_as(
            r#"
            SELECT conversation_id, user_id, tokens_used, locked
            FROM free_tier_usage
            WHERE (locked = false AND tokens_used >= $1)
               OR (locked = true AND tokens_used < $1)
            "#,
        )
        .bind(FREE_TIER_TOKEN_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_tier_lock_consistency".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Conversation {} has {} tokens with locked={}",
                    row.conversation_id, row.tokens_used, row.locked
                ),
                context: serde_json::json!({
                    "conversation_id": row.conversation_id,
                    "tokens_used": row.tokens_used,
                    "locked": row.locked,
                    "ceiling": FREE_TIER_TOKEN_LIMIT,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 6: subscription period bounds are ordered.
    ///
    /// The lifecycle mapper rejects these at the boundary; a hit means a
    /// write path bypassed validation.
    async fn check_subscription_periods_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadPeriodRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, user_id, current_period_start, current_period_end
            FROM subscriptions
            WHERE current_period_end <= current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_periods_ordered".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Subscription {} period ends at {} before it starts at {}",
                    row.subscription_id, row.current_period_end, row.current_period_start
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "current_period_start": row.current_period_start.to_string(),
                    "current_period_end": row.current_period_end.to_string(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_cycle" => self.check_single_active_cycle().await,
            "overage_matches_ledger" => self.check_overage_matches_ledger().await,
            "cycle_within_subscription_period" => {
                self.check_cycle_within_subscription_period().await
            }
            "expired_cycles_not_stuck" => self.check_expired_cycles_not_stuck().await,
            "free_tier_lock_consistency" => self.check_free_tier_lock_consistency().await,
            "subscription_periods_ordered" => self.check_subscription_periods_ordered().await,
            _ => Ok(vec![]),
        }
    }

    /// All available invariant checks.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_cycle",
            "overage_matches_ledger",
            "cycle_within_subscription_period",
            "expired_cycles_not_stuck",
            "free_tier_lock_consistency",
            "subscription_periods_ordered",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_active_cycle"));
        assert!(checks.contains(&"overage_matches_ledger"));
    }
}
