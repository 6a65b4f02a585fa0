//! Billing cycle lifecycle.
//!
//! A cycle mirrors the subscription's current period and accumulates token
//! usage and cost against the period's included credit. At most one cycle
//! per user is `active` at a time; the partial unique index on
//! `billing_cycles` backs that invariant and `FOR UPDATE` row locks
//! serialize the writers that roll cycles over (usage recording, renewal
//! resets, and the invoicing engine's completions).

use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{SubscriptionRecord, SubscriptionService};

/// A billing cycle row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingCycle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub tokens_used: i64,
    pub token_cost: f64,
    pub included_credit: f64,
    pub overage_amount: f64,
    pub status: String,
    pub stripe_invoice_id: Option<String>,
}

/// Overage owed for a cycle: cost beyond the included credit, floored at
/// zero. Holds after every usage mutation.
pub fn overage_for(token_cost: f64, included_credit: f64) -> f64 {
    (token_cost - included_credit).max(0.0)
}

/// Whether an active cycle's bounds still match the subscription's current
/// period. A cycle that started before the period or ends after it is
/// stale and must be rolled over.
pub(crate) fn bounds_match(
    cycle_start: OffsetDateTime,
    cycle_end: OffsetDateTime,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> bool {
    cycle_start >= period_start && cycle_end <= period_end
}

#[derive(Clone)]
pub struct BillingCycleManager {
    pool: PgPool,
    subscriptions: SubscriptionService,
}

impl BillingCycleManager {
    pub fn new(pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            pool,
            subscriptions,
        }
    }

    /// Resolve the user's active cycle, creating one lazily from the
    /// subscription's current period if needed.
    ///
    /// Errors with `NoActiveSubscription` for unsubscribed users; free-tier
    /// usage never owns a cycle.
    pub async fn get_or_create_active_cycle(&self, user_id: Uuid) -> BillingResult<Uuid> {
        let subscription = self
            .subscriptions
            .get_active_for_user(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))?;

        let mut tx = self.pool.begin().await?;
        let cycle_id = Self::resolve_active_cycle(&mut tx, &subscription).await?;
        tx.commit().await?;

        Ok(cycle_id)
    }

    /// Resolve (or roll over) the active cycle for a subscription inside an
    /// open transaction, locking the current active row.
    ///
    /// When the subscription's period has advanced past the cycle's bounds,
    /// the stale cycle is completed as a rollover (no invoicing; same
    /// semantics as a renewal reset) and a fresh snapshot is inserted.
    pub(crate) async fn resolve_active_cycle(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<Uuid> {
        let existing: Option<(Uuid, OffsetDateTime, OffsetDateTime)> = sqlx::query_as(
            "SELECT id, period_start, period_end FROM billing_cycles \
             WHERE user_id = $1 AND status = 'active' FOR UPDATE",
        )
        .bind(subscription.user_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((cycle_id, cycle_start, cycle_end)) = existing {
            if bounds_match(
                cycle_start,
                cycle_end,
                subscription.current_period_start,
                subscription.current_period_end,
            ) {
                return Ok(cycle_id);
            }

            tracing::info!(
                user_id = %subscription.user_id,
                cycle_id = %cycle_id,
                "Billing cycle bounds stale, rolling over to current period"
            );
            sqlx::query(
                "UPDATE billing_cycles SET status = 'completed', completed_at = NOW() \
                 WHERE id = $1",
            )
            .bind(cycle_id)
            .execute(&mut **tx)
            .await?;
        }

        Self::insert_snapshot(tx, subscription).await
    }

    /// Insert a fresh active cycle snapshotted from the subscription:
    /// zeroed aggregates, the period's bounds, and the period's credit.
    async fn insert_snapshot(
        tx: &mut Transaction<'_, Postgres>,
        subscription: &SubscriptionRecord,
    ) -> BillingResult<Uuid> {
        let cycle_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO billing_cycles (
                id, user_id, subscription_id, period_start, period_end,
                tokens_used, token_cost, included_credit, overage_amount, status
            ) VALUES (
                $1, $2, $3, $4, $5, 0, 0, $6, 0, 'active'
            )
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription.user_id)
        .bind(subscription.id)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.included_credit_usd)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            user_id = %subscription.user_id,
            cycle_id = %cycle_id,
            included_credit = subscription.included_credit_usd,
            "Created billing cycle"
        );

        Ok(cycle_id)
    }

    /// Roll the user's cycle over on subscription renewal.
    ///
    /// Completes any active cycle without invoicing (a renewal reset is a
    /// rollover, not an invoicing event) and starts a fresh cycle with
    /// zeroed aggregates. Unused credit is forfeited; usage never carries
    /// over. Safe to race with the invoicing engine: whichever writer
    /// commits first completes the old cycle, and the engine never
    /// recreates cycles, so the cycle created here wins.
    pub async fn reset_token_credit(&self, subscription_id: Uuid) -> BillingResult<Uuid> {
        let subscription = self.subscriptions.get_by_id(subscription_id).await?;

        let mut tx = self.pool.begin().await?;

        let completed = sqlx::query(
            "UPDATE billing_cycles SET status = 'completed', completed_at = NOW() \
             WHERE user_id = $1 AND status = 'active'",
        )
        .bind(subscription.user_id)
        .execute(&mut *tx)
        .await?;

        let cycle_id = Self::insert_snapshot(&mut tx, &subscription).await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription_id,
            completed_cycles = completed.rows_affected(),
            new_cycle_id = %cycle_id,
            "Token credit reset"
        );

        Ok(cycle_id)
    }

    /// Stamp the active cycle for a subscription with an external invoice
    /// id (used when a renewal invoice payment lands before the cycle is
    /// rolled over).
    pub async fn attach_invoice(
        &self,
        subscription_id: Uuid,
        stripe_invoice_id: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE billing_cycles SET stripe_invoice_id = $1 \
             WHERE subscription_id = $2 AND status = 'active'",
        )
        .bind(stripe_invoice_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Load a cycle by id.
    pub async fn get_cycle(&self, cycle_id: Uuid) -> BillingResult<BillingCycle> {
        let cycle: Option<BillingCycle> = sqlx::query_as(
            "SELECT id, user_id, subscription_id, period_start, period_end, tokens_used, \
                    token_cost, included_credit, overage_amount, status, stripe_invoice_id \
             FROM billing_cycles WHERE id = $1",
        )
        .bind(cycle_id)
        .fetch_optional(&self.pool)
        .await?;

        cycle.ok_or_else(|| BillingError::NotFound(format!("billing cycle {cycle_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_overage_floors_at_zero() {
        assert_eq!(overage_for(5.0, 10.0), 0.0);
        assert_eq!(overage_for(10.0, 10.0), 0.0);
        assert_eq!(overage_for(12.5, 10.0), 2.5);
    }

    #[test]
    fn test_bounds_match_current_period() {
        let start = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let end = start + Duration::days(30);

        assert!(bounds_match(start, end, start, end));
        // A cycle that began before the current period is stale.
        assert!(!bounds_match(start - Duration::days(30), start, start, end));
        // A cycle that outlives the current period is stale.
        assert!(!bounds_match(start, end + Duration::days(1), start, end));
    }
}
