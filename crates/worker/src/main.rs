//! Arbor Background Worker
//!
//! Handles scheduled billing jobs:
//! - Overage invoicing for expired billing cycles (hourly)
//! - Usage record retention sweep (daily at 3:00 AM UTC)
//! - Webhook event ledger cleanup (daily at 4:00 AM UTC)
//! - Billing invariant sweep (daily at 5:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use arbor_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Arbor Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Overage invoicing for expired billing cycles (hourly)
    // Cycles left active after a failure are retried by the next run.
    let invoicing_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invoicing_billing.clone();
            Box::pin(async move {
                info!("Running overage invoicing job");
                let summary = billing.invoicing.process_overage_billing().await;
                info!(
                    processed = summary.processed,
                    invoiced = summary.invoiced,
                    errors = summary.errors,
                    "Overage invoicing job complete"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Overage invoicing (hourly)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Job 3: Usage record retention sweep (daily at 3:00 AM UTC)
    // Usage records are immutable; this sweep is the only deletion path.
    let retention_billing = billing.clone();
    let retention_days: i64 = std::env::var("USAGE_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(90);
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = retention_billing.clone();
            Box::pin(async move {
                info!(retention_days = retention_days, "Running usage retention sweep");
                match billing.usage.purge_old_records(retention_days).await {
                    Ok(deleted) => info!(deleted = deleted, "Usage retention sweep complete"),
                    Err(e) => error!(error = %e, "Usage retention sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Usage retention sweep (daily at 3:00 AM UTC)");

    // Job 4: Webhook event ledger cleanup (daily at 4:00 AM UTC)
    // Settled events older than 7 days are no longer needed for
    // idempotency; rows still marked processing are kept for inspection.
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running webhook ledger cleanup");
                let result = sqlx::query(
                    r#"
                    DELETE FROM webhook_events
                    WHERE processing_result IN ('success', 'error')
                      AND processing_started_at < NOW() - INTERVAL '7 days'
                    "#,
                )
                .execute(&pool)
                .await;

                match result {
                    Ok(r) => info!(deleted = r.rows_affected(), "Webhook ledger cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook ledger cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook ledger cleanup (daily at 4:00 AM UTC)");

    // Job 5: Billing invariant sweep (daily at 5:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violation"
                            );
                        }
                        info!(
                            checks_run = summary.checks_run,
                            checks_passed = summary.checks_passed,
                            violations = summary.violations.len(),
                            healthy = summary.healthy,
                            "Billing invariant sweep complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (daily at 5:00 AM UTC)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Arbor Worker started successfully with 5 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
