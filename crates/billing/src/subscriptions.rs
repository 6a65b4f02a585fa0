//! Subscription mirror.
//!
//! Local read model of the external subscription, owned by the webhook
//! lifecycle handler and read-only to the rest of the billing core. Upserts
//! are keyed by the external subscription id so duplicate event delivery
//! converges on the same row.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use arbor_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};

/// A mirrored subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub included_credit_usd: f64,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, stripe_customer_id, stripe_subscription_id, \
     status, current_period_start, current_period_end, included_credit_usd";

/// Fields accepted from a validated provider event when upserting the
/// mirror row.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub included_credit_usd: f64,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The user's active subscription, if any.
    pub async fn get_active_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = $1 AND status = 'active'"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_id(&self, subscription_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| BillingError::NotFound(format!("subscription {subscription_id}")))
    }

    pub async fn get_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Upsert the mirror row from a validated provider payload.
    ///
    /// Returns the local row id and the period start that was stored before
    /// the upsert (None for a fresh row), so the caller can detect a
    /// renewal.
    pub async fn upsert(
        &self,
        fields: &SubscriptionUpsert,
    ) -> BillingResult<(Uuid, Option<OffsetDateTime>)> {
        let previous_start: Option<OffsetDateTime> = sqlx::query_scalar(
            "SELECT current_period_start FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(&fields.stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_customer_id, stripe_subscription_id, status,
                current_period_start, current_period_end, included_credit_usd,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW()
            )
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                included_credit_usd = EXCLUDED.included_credit_usd,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fields.user_id)
        .bind(&fields.stripe_customer_id)
        .bind(&fields.stripe_subscription_id)
        .bind(fields.status.as_str())
        .bind(fields.current_period_start)
        .bind(fields.current_period_end)
        .bind(fields.included_credit_usd)
        .fetch_one(&self.pool)
        .await?;

        Ok((id, previous_start))
    }

    /// Patch the status of a mirrored subscription by external id.
    ///
    /// Returns false when no such row exists (e.g. an event for a
    /// subscription that was never mirrored).
    pub async fn set_status_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = NOW() \
             WHERE stripe_subscription_id = $2",
        )
        .bind(status.as_str())
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
