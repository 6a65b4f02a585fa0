//! Billing error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors surfaced by the billing core.
///
/// Validation errors (`NotFound`, `NoActiveSubscription`,
/// `NoActiveBillingCycle`) are raised synchronously to the caller and are
/// never retried. Provider errors may be transient; whether a call is
/// retried is the caller's decision (see `retry`).
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no active subscription for user {0}")]
    NoActiveSubscription(Uuid),

    #[error("no active billing cycle for user {0}")]
    NoActiveBillingCycle(Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("malformed event payload: {0}")]
    EventPayloadInvalid(String),

    #[error("external call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}
