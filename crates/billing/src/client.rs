//! Stripe client construction and configuration.
//!
//! One `stripe::Client` is built per process, explicitly, from environment
//! configuration read at construction time. Services clone the wrapper; the
//! config rides along in an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_live_...` / `sk_test_...`).
    pub secret_key: String,
    /// Webhook signing secret (`whsec_...`).
    pub webhook_secret: String,
    /// Upper bound on any single Stripe call made by the batch engine.
    pub call_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY must be set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))?;

        let call_timeout_secs: u64 = std::env::var("STRIPE_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            secret_key,
            webhook_secret,
            call_timeout: Duration::from_secs(call_timeout_secs),
        })
    }
}

/// Shared Stripe client handle.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying `stripe::Client` for API calls.
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
