//! Overage invoicing.
//!
//! Hourly batch that closes out billing cycles whose period has ended:
//! trivial overage is written off, real overage is invoiced through Stripe,
//! and each cycle is settled independently so one failure never aborts the
//! batch. There is no in-call retry; a cycle left active after a failure is
//! picked up again by the next run (at-least-once, with provider-side
//! idempotency keyed by the metadata we attach).

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CollectionMethod, CreateInvoice, CreateInvoiceItem, Currency, CustomerId, Invoice, InvoiceItem,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Default minimum overage worth invoicing, in USD. Anything at or below
/// this is written off to avoid processing fees on trivial amounts.
const DEFAULT_MIN_INVOICE_USD: f64 = 0.50;

/// Invoicing policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct InvoicePolicy {
    /// Overage must strictly exceed this to be invoiced.
    pub min_invoice_usd: f64,
}

impl Default for InvoicePolicy {
    fn default() -> Self {
        Self {
            min_invoice_usd: DEFAULT_MIN_INVOICE_USD,
        }
    }
}

impl InvoicePolicy {
    /// Load policy from environment or use defaults.
    pub fn from_env() -> Self {
        Self {
            min_invoice_usd: std::env::var("OVERAGE_MIN_INVOICE_USD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MIN_INVOICE_USD),
        }
    }
}

/// Convert a USD overage amount to invoice cents, half-up.
pub fn overage_cents(amount_usd: f64) -> i64 {
    (amount_usd * 100.0).round() as i64
}

/// Threshold check: strictly greater than the minimum is invoiced.
pub fn should_invoice(overage_usd: f64, min_invoice_usd: f64) -> bool {
    overage_usd > min_invoice_usd
}

/// Aggregate result of one batch run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OverageRunSummary {
    /// Expired cycles examined this run.
    pub processed: usize,
    /// Invoices issued.
    pub invoiced: usize,
    /// Cycles left active for the next run after a failure.
    pub errors: usize,
}

/// Per-cycle outcome within a batch run.
#[derive(Debug)]
pub(crate) enum CycleOutcome {
    Invoiced {
        cycle_id: Uuid,
        invoice_id: String,
        amount_cents: i64,
    },
    BelowThreshold {
        cycle_id: Uuid,
        overage: f64,
    },
    Error {
        cycle_id: Uuid,
        error: String,
    },
}

impl OverageRunSummary {
    pub(crate) fn from_outcomes(outcomes: &[CycleOutcome]) -> Self {
        Self {
            processed: outcomes.len(),
            invoiced: outcomes
                .iter()
                .filter(|o| matches!(o, CycleOutcome::Invoiced { .. }))
                .count(),
            errors: outcomes
                .iter()
                .filter(|o| matches!(o, CycleOutcome::Error { .. }))
                .count(),
        }
    }
}

/// An expired active cycle joined with its Stripe customer.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ExpiredCycleRow {
    id: Uuid,
    user_id: Uuid,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    overage_amount: f64,
    stripe_customer_id: String,
}

#[derive(Clone)]
pub struct InvoicingService {
    stripe: StripeClient,
    pool: PgPool,
    policy: InvoicePolicy,
}

impl InvoicingService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            pool,
            policy: InvoicePolicy::from_env(),
        }
    }

    pub fn with_policy(stripe: StripeClient, pool: PgPool, policy: InvoicePolicy) -> Self {
        Self {
            stripe,
            pool,
            policy,
        }
    }

    /// Close out all expired active cycles. Run hourly by the worker.
    pub async fn process_overage_billing(&self) -> OverageRunSummary {
        let cycles: Vec<ExpiredCycleRow> = match sqlx::query_as(
            r#"
            SELECT c.id, c.user_id, c.period_start, c.period_end,
                   c.overage_amount, s.stripe_customer_id
            FROM billing_cycles c
            JOIN subscriptions s ON s.id = c.subscription_id
            WHERE c.status = 'active'
              AND c.period_end < NOW()
            ORDER BY c.period_end ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(cycles) => cycles,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query expired billing cycles");
                return OverageRunSummary::default();
            }
        };

        let mut outcomes = Vec::with_capacity(cycles.len());
        for cycle in &cycles {
            let outcome = self.settle_cycle(cycle).await;
            if let CycleOutcome::Error { cycle_id, error } = &outcome {
                tracing::error!(
                    cycle_id = %cycle_id,
                    user_id = %cycle.user_id,
                    error = %error,
                    "Failed to settle billing cycle, will retry next run"
                );
            }
            outcomes.push(outcome);
        }

        let summary = OverageRunSummary::from_outcomes(&outcomes);
        tracing::info!(
            processed = summary.processed,
            invoiced = summary.invoiced,
            errors = summary.errors,
            "Overage billing run complete"
        );

        summary
    }

    /// Settle one cycle. Never propagates: every path folds into an
    /// outcome so siblings in the batch are unaffected.
    async fn settle_cycle(&self, cycle: &ExpiredCycleRow) -> CycleOutcome {
        if !should_invoice(cycle.overage_amount, self.policy.min_invoice_usd) {
            return match self.complete_cycle(cycle.id, None).await {
                Ok(()) => CycleOutcome::BelowThreshold {
                    cycle_id: cycle.id,
                    overage: cycle.overage_amount,
                },
                Err(e) => CycleOutcome::Error {
                    cycle_id: cycle.id,
                    error: e.to_string(),
                },
            };
        }

        let (invoice_id, amount_cents) = match self.invoice_cycle(cycle).await {
            Ok(result) => result,
            Err(e) => {
                // Cycle stays active; its period_end is still in the past,
                // so the next hourly run retries it.
                return CycleOutcome::Error {
                    cycle_id: cycle.id,
                    error: e.to_string(),
                };
            }
        };

        match self.complete_cycle(cycle.id, Some(&invoice_id)).await {
            Ok(()) => CycleOutcome::Invoiced {
                cycle_id: cycle.id,
                invoice_id,
                amount_cents,
            },
            Err(e) => CycleOutcome::Error {
                cycle_id: cycle.id,
                error: format!("invoice {invoice_id} created but cycle not completed: {e}"),
            },
        }
    }

    /// Create, then finalize, a Stripe invoice for the cycle's overage.
    async fn invoice_cycle(&self, cycle: &ExpiredCycleRow) -> BillingResult<(String, i64)> {
        let customer_id = cycle
            .stripe_customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {e}")))?;

        let amount_cents = overage_cents(cycle.overage_amount);
        let description = format!(
            "Token overage for billing period {} to {}",
            cycle.period_start.date(),
            cycle.period_end.date()
        );

        let mut item_params = CreateInvoiceItem::new(customer_id.clone());
        item_params.amount = Some(amount_cents);
        item_params.currency = Some(Currency::USD);
        item_params.description = Some(&description);

        self.bounded(InvoiceItem::create(self.stripe.inner(), item_params))
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("billing_cycle_id".to_string(), cycle.id.to_string());
        metadata.insert("charge_type".to_string(), "overage".to_string());

        let mut invoice_params = CreateInvoice::new();
        invoice_params.customer = Some(customer_id);
        invoice_params.collection_method = Some(CollectionMethod::ChargeAutomatically);
        invoice_params.auto_advance = Some(true);
        invoice_params.metadata = Some(metadata);

        let invoice = self
            .bounded(Invoice::create(self.stripe.inner(), invoice_params))
            .await?;

        let finalized = self
            .bounded(Invoice::finalize(
                self.stripe.inner(),
                &invoice.id,
                stripe::FinalizeInvoiceParams {
                    auto_advance: Some(true),
                },
            ))
            .await?;

        tracing::info!(
            cycle_id = %cycle.id,
            user_id = %cycle.user_id,
            invoice_id = %finalized.id,
            amount_cents = amount_cents,
            "Invoiced cycle overage"
        );

        Ok((finalized.id.to_string(), amount_cents))
    }

    /// Mark a cycle completed, stamping the invoice id when one was
    /// issued. The status guard means a renewal reset that completed the
    /// cycle first wins; this engine never recreates or reopens cycles.
    async fn complete_cycle(
        &self,
        cycle_id: Uuid,
        stripe_invoice_id: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_cycles
            SET status = 'completed',
                completed_at = NOW(),
                stripe_invoice_id = COALESCE($1, stripe_invoice_id)
            WHERE id = $2 AND status = 'active'
            "#,
        )
        .bind(stripe_invoice_id)
        .bind(cycle_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(
                cycle_id = %cycle_id,
                "Cycle already completed by a renewal reset, nothing to do"
            );
        }

        Ok(())
    }

    /// Bound a Stripe call with the configured timeout; a timeout is
    /// treated like any other failure.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, stripe::StripeError>>,
    ) -> BillingResult<T> {
        let timeout = self.stripe.config().call_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => Err(BillingError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overage_cents_rounds_half_up() {
        assert_eq!(overage_cents(1.999), 200);
        assert_eq!(overage_cents(2.5), 250);
        assert_eq!(overage_cents(0.505), 51);
        assert_eq!(overage_cents(0.0), 0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let policy = InvoicePolicy::default();
        assert!(!should_invoice(0.50, policy.min_invoice_usd));
        assert!(should_invoice(0.51, policy.min_invoice_usd));
        assert!(!should_invoice(0.0, policy.min_invoice_usd));
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let cycle_a = Uuid::new_v4();
        let cycle_b = Uuid::new_v4();
        let cycle_c = Uuid::new_v4();

        let outcomes = vec![
            CycleOutcome::Error {
                cycle_id: cycle_a,
                error: "stripe unavailable".to_string(),
            },
            CycleOutcome::Invoiced {
                cycle_id: cycle_b,
                invoice_id: "in_test_123".to_string(),
                amount_cents: 250,
            },
            CycleOutcome::BelowThreshold {
                cycle_id: cycle_c,
                overage: 0.25,
            },
        ];

        let summary = OverageRunSummary::from_outcomes(&outcomes);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.invoiced, 1);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn test_empty_run_summary() {
        let summary = OverageRunSummary::from_outcomes(&[]);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.invoiced, 0);
        assert_eq!(summary.errors, 0);
    }
}
