//! Usage recording.
//!
//! Appends one immutable usage record per completed chat turn and updates
//! the owning aggregate: the user's active billing cycle on the paid tier,
//! or the per-conversation free-tier row otherwise. Each call is a single
//! transaction; failures propagate to the caller and nothing is retried
//! here.

use sqlx::PgPool;
use uuid::Uuid;

use arbor_shared::types::FREE_TIER_TOKEN_LIMIT;

use crate::cycles::BillingCycleManager;
use crate::error::BillingResult;
use crate::subscriptions::SubscriptionService;

/// Outcome of recording one turn of usage.
#[derive(Debug, Clone)]
pub struct RecordedUsage {
    pub usage_record_id: Uuid,
    /// The cycle the record was charged to; None on the free tier.
    pub billing_cycle_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct UsageRecorder {
    pool: PgPool,
    subscriptions: SubscriptionService,
}

impl UsageRecorder {
    pub fn new(pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            pool,
            subscriptions,
        }
    }

    /// Record a completed turn.
    ///
    /// `token_cost` is the billed USD cost for the turn, already computed
    /// from the model pricing table by the caller.
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        node_id: Uuid,
        model: &str,
        tokens_used: i64,
        token_cost: f64,
    ) -> BillingResult<RecordedUsage> {
        let subscription = self.subscriptions.get_active_for_user(user_id).await?;

        let mut tx = self.pool.begin().await?;

        let billing_cycle_id = match subscription {
            Some(subscription) => {
                let cycle_id =
                    BillingCycleManager::resolve_active_cycle(&mut tx, &subscription).await?;

                // Accumulate the turn and keep the overage ledger in step:
                // overage == max(0, token_cost - included_credit) after
                // every mutation.
                sqlx::query(
                    r#"
                    UPDATE billing_cycles SET
                        tokens_used = tokens_used + $1,
                        token_cost = token_cost + $2,
                        overage_amount = GREATEST(0, token_cost + $2 - included_credit)
                    WHERE id = $3
                    "#,
                )
                .bind(tokens_used)
                .bind(token_cost)
                .bind(cycle_id)
                .execute(&mut *tx)
                .await?;

                Some(cycle_id)
            }
            None => {
                // Free tier: lifetime per-conversation aggregate. The lock
                // flag latches once the ceiling is reached and never
                // clears.
                sqlx::query(
                    r#"
                    INSERT INTO free_tier_usage (conversation_id, user_id, tokens_used, locked)
                    VALUES ($1, $2, $3, $3 >= $4)
                    ON CONFLICT (conversation_id) DO UPDATE SET
                        tokens_used = free_tier_usage.tokens_used + EXCLUDED.tokens_used,
                        locked = free_tier_usage.locked
                            OR free_tier_usage.tokens_used + EXCLUDED.tokens_used >= $4
                    "#,
                )
                .bind(conversation_id)
                .bind(user_id)
                .bind(tokens_used)
                .bind(FREE_TIER_TOKEN_LIMIT)
                .execute(&mut *tx)
                .await?;

                None
            }
        };

        let usage_record_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO usage_records (
                id, user_id, conversation_id, node_id, model,
                tokens_used, token_cost, billing_cycle_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8
            )
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(conversation_id)
        .bind(node_id)
        .bind(model)
        .bind(tokens_used)
        .bind(token_cost)
        .bind(billing_cycle_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            model = %model,
            tokens_used = tokens_used,
            token_cost = token_cost,
            billing_cycle_id = ?billing_cycle_id,
            "Recorded usage"
        );

        Ok(RecordedUsage {
            usage_record_id,
            billing_cycle_id,
        })
    }

    /// Delete usage records older than the retention window.
    ///
    /// Usage records are otherwise immutable; this sweep is the only path
    /// that removes them. Run daily by the worker.
    pub async fn purge_old_records(&self, retention_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM usage_records WHERE created_at < NOW() - $1 * INTERVAL '1 day'",
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(
                deleted = deleted,
                retention_days = retention_days,
                "Purged expired usage records"
            );
        }

        Ok(deleted)
    }
}
