// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Usage recording takes the full turn context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Arbor Billing Module
//!
//! Usage metering and billing-cycle reconciliation for the Arbor chat
//! product.
//!
//! ## Features
//!
//! - **Usage Recording**: One immutable record per completed chat turn,
//!   charged to the active billing cycle or the free-tier aggregate
//! - **Billing Cycles**: Per-user cycles mirroring the external
//!   subscription period, rolled over on renewal
//! - **Admission Control**: Credit and free-tier token limits consulted
//!   before a model request
//! - **Overage Invoicing**: Hourly batch that closes expired cycles and
//!   invoices overage through Stripe with per-cycle failure isolation
//! - **Lifecycle Handling**: Stripe webhook events drive the subscription
//!   mirror and credit resets
//! - **Invariants**: Runnable consistency checks over the billing state

pub mod client;
pub mod cycles;
pub mod error;
pub mod invariants;
pub mod invoicing;
pub mod limits;
pub mod retry;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Cycles
pub use cycles::{overage_for, BillingCycle, BillingCycleManager};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoicing
pub use invoicing::{
    overage_cents, should_invoice, InvoicePolicy, InvoicingService, OverageRunSummary,
};

// Limits
pub use limits::{
    TokenLimitCheck, TokenLimiter, REASON_CONVERSATION_LIMIT, REASON_CREDIT_EXCEEDED,
    REASON_FREE_TIER_LIMIT,
};

// Retry
pub use retry::RetryPolicy;

// Subscriptions
pub use subscriptions::{SubscriptionRecord, SubscriptionService, SubscriptionUpsert};

// Usage
pub use usage::{RecordedUsage, UsageRecorder};

// Webhooks
pub use webhooks::{LifecycleEvent, SubscriptionPayload, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub cycles: BillingCycleManager,
    pub invariants: InvariantChecker,
    pub invoicing: InvoicingService,
    pub limits: TokenLimiter,
    pub subscriptions: SubscriptionService,
    pub usage: UsageRecorder,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a new billing service with an explicit Stripe client
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            cycles: BillingCycleManager::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            invoicing: InvoicingService::new(stripe.clone(), pool.clone()),
            limits: TokenLimiter::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            usage: UsageRecorder::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
