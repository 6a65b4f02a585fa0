//! Subscription lifecycle handling for Stripe webhook events.
//!
//! Raw provider events are verified, claimed exactly once in the
//! `webhook_events` ledger, then validated into an internal event schema
//! before any handler runs. Handlers are idempotent: duplicate delivery
//! converges on the same mirror state.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Customer, CustomerId, Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use arbor_shared::SubscriptionStatus;

use crate::client::StripeClient;
use crate::cycles::BillingCycleManager;
use crate::error::{BillingError, BillingResult};
use crate::retry::{self, RetryPolicy};
use crate::subscriptions::{SubscriptionService, SubscriptionUpsert};

type HmacSha256 = Hmac<Sha256>;

/// Included token credit (USD) assumed when the provider subscription
/// carries no `included_credit_usd` metadata.
const DEFAULT_INCLUDED_CREDIT_USD: f64 = 10.0;

/// Maximum age of a webhook signature timestamp.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this can be reclaimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Validated view of a provider subscription payload.
#[derive(Debug, Clone)]
pub struct SubscriptionPayload {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    /// Owning user when present in subscription metadata; otherwise
    /// resolved from customer metadata.
    pub user_id: Option<Uuid>,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub included_credit_usd: f64,
}

/// Internal event schema: the tagged union of lifecycle events this core
/// consumes. Provider payloads are mapped and validated into this at the
/// boundary instead of trusting duck-typed fields downstream.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted {
        stripe_subscription_id: String,
    },
    InvoicePaymentSucceeded {
        stripe_invoice_id: String,
        stripe_subscription_id: Option<String>,
    },
    InvoicePaymentFailed {
        stripe_subscription_id: Option<String>,
    },
}

/// Map a verified provider event into the internal schema.
///
/// Returns `Ok(None)` for event types this core does not consume, and
/// `EventPayloadInvalid` for events of a handled type whose payload does
/// not hold together.
pub fn map_event(event: &Event) -> BillingResult<Option<LifecycleEvent>> {
    match event.type_ {
        EventType::CustomerSubscriptionCreated => Ok(Some(LifecycleEvent::SubscriptionCreated(
            subscription_payload(event)?,
        ))),
        EventType::CustomerSubscriptionUpdated => Ok(Some(LifecycleEvent::SubscriptionUpdated(
            subscription_payload(event)?,
        ))),
        EventType::CustomerSubscriptionDeleted => {
            let subscription = extract_subscription(event)?;
            Ok(Some(LifecycleEvent::SubscriptionDeleted {
                stripe_subscription_id: subscription.id.to_string(),
            }))
        }
        EventType::InvoicePaymentSucceeded => {
            let invoice = extract_invoice(event)?;
            Ok(Some(LifecycleEvent::InvoicePaymentSucceeded {
                stripe_invoice_id: invoice.id.to_string(),
                stripe_subscription_id: expandable_id(&invoice.subscription),
            }))
        }
        EventType::InvoicePaymentFailed => {
            let invoice = extract_invoice(event)?;
            Ok(Some(LifecycleEvent::InvoicePaymentFailed {
                stripe_subscription_id: expandable_id(&invoice.subscription),
            }))
        }
        _ => Ok(None),
    }
}

fn extract_subscription(event: &Event) -> BillingResult<&stripe::Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::EventPayloadInvalid(format!(
            "expected subscription object for {}",
            event.type_
        ))),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<&stripe::Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::EventPayloadInvalid(format!(
            "expected invoice object for {}",
            event.type_
        ))),
    }
}

fn subscription_payload(event: &Event) -> BillingResult<SubscriptionPayload> {
    let subscription = extract_subscription(event)?;

    let current_period_start = OffsetDateTime::from_unix_timestamp(
        subscription.current_period_start,
    )
    .map_err(|_| BillingError::EventPayloadInvalid("invalid period start".to_string()))?;
    let current_period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
        .map_err(|_| BillingError::EventPayloadInvalid("invalid period end".to_string()))?;

    if current_period_end <= current_period_start {
        return Err(BillingError::EventPayloadInvalid(format!(
            "period end {current_period_end} not after period start {current_period_start}"
        )));
    }

    let stripe_customer_id = match &subscription.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    };

    Ok(SubscriptionPayload {
        stripe_subscription_id: subscription.id.to_string(),
        stripe_customer_id,
        user_id: user_id_from_metadata(&subscription.metadata),
        status: map_subscription_status(subscription.status),
        current_period_start,
        current_period_end,
        included_credit_usd: included_credit_from_metadata(&subscription.metadata),
    })
}

/// Collapse the provider's status space onto the mirror's three states.
fn map_subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing => {
            SubscriptionStatus::Active
        }
        stripe::SubscriptionStatus::PastDue | stripe::SubscriptionStatus::Unpaid => {
            SubscriptionStatus::PastDue
        }
        stripe::SubscriptionStatus::Canceled
        | stripe::SubscriptionStatus::Incomplete
        | stripe::SubscriptionStatus::IncompleteExpired
        | stripe::SubscriptionStatus::Paused => SubscriptionStatus::Canceled,
    }
}

fn user_id_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata.get("user_id").and_then(|id| Uuid::parse_str(id).ok())
}

fn included_credit_from_metadata(metadata: &HashMap<String, String>) -> f64 {
    metadata
        .get("included_credit_usd")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_INCLUDED_CREDIT_USD)
}

fn expandable_id<T>(expandable: &Option<stripe::Expandable<T>>) -> Option<String>
where
    T: stripe::Object + Clone,
    T::Id: ToString,
{
    match expandable {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(object)) => Some(object.id().to_string()),
        None => None,
    }
}

/// Parse Stripe's `t=...,v1=...` signature header.
fn parse_signature_header(signature: &str) -> Option<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        match part.splitn(2, '=').collect::<Vec<_>>().as_slice() {
            ["t", value] => timestamp = value.parse().ok(),
            ["v1", value] => v1_signature = Some((*value).to_string()),
            _ => {}
        }
    }

    Some((timestamp?, v1_signature?))
}

/// Webhook handler for provider lifecycle events.
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    subscriptions: SubscriptionService,
    cycles: BillingCycleManager,
    retry_policy: RetryPolicy,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let subscriptions = SubscriptionService::new(pool.clone());
        let cycles = BillingCycleManager::new(pool.clone());
        Self {
            stripe,
            pool,
            subscriptions,
            cycles,
            retry_policy: RetryPolicy::from_env(),
        }
    }

    /// Verify and parse a webhook payload.
    ///
    /// Tries the library's verification first, then falls back to a manual
    /// HMAC-SHA256 check; the library rejects payloads from Stripe API
    /// versions newer than the one it was generated against.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let (timestamp, v1_signature) = parse_signature_header(signature).ok_or_else(|| {
            tracing::error!("Malformed webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// An atomic `INSERT ... ON CONFLICT ... RETURNING` on the ledger
    /// claims exclusive processing rights, so a replayed or concurrently
    /// delivered event runs its handler at most once. Rows stuck in
    /// `processing` past the timeout are reclaimable.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events
                (id, stripe_event_id, event_type, event_timestamp,
                 processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE webhook_events.processing_result = 'processing'
              AND webhook_events.processing_started_at < NOW() - ($5 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event_id)
        .bind(&event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing lifecycle event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE webhook_events SET processing_result = $1, error_message = $2 \
             WHERE stripe_event_id = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        let Some(lifecycle_event) = map_event(event)? else {
            tracing::info!(
                event_type = %event.type_,
                event_id = %event.id,
                "Unhandled event type, ignoring"
            );
            return Ok(());
        };

        match lifecycle_event {
            LifecycleEvent::SubscriptionCreated(payload) => {
                self.upsert_subscription(payload, false).await
            }
            LifecycleEvent::SubscriptionUpdated(payload) => {
                self.upsert_subscription(payload, true).await
            }
            LifecycleEvent::SubscriptionDeleted {
                stripe_subscription_id,
            } => self.handle_subscription_deleted(&stripe_subscription_id).await,
            LifecycleEvent::InvoicePaymentSucceeded {
                stripe_invoice_id,
                stripe_subscription_id,
            } => {
                self.handle_invoice_payment_succeeded(&stripe_invoice_id, stripe_subscription_id)
                    .await
            }
            LifecycleEvent::InvoicePaymentFailed {
                stripe_subscription_id,
            } => self.handle_invoice_payment_failed(stripe_subscription_id).await,
        }
    }

    /// Upsert the mirror row for a created/updated subscription. On an
    /// update whose period start moved, the renewal rolls the user's
    /// billing cycle over asynchronously.
    async fn upsert_subscription(
        &self,
        payload: SubscriptionPayload,
        detect_renewal: bool,
    ) -> BillingResult<()> {
        let user_id = match payload.user_id {
            Some(user_id) => user_id,
            None => self.resolve_user_from_customer(&payload.stripe_customer_id).await?,
        };

        let (subscription_id, previous_start) = self
            .subscriptions
            .upsert(&SubscriptionUpsert {
                user_id,
                stripe_customer_id: payload.stripe_customer_id.clone(),
                stripe_subscription_id: payload.stripe_subscription_id.clone(),
                status: payload.status,
                current_period_start: payload.current_period_start,
                current_period_end: payload.current_period_end,
                included_credit_usd: payload.included_credit_usd,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            stripe_subscription_id = %payload.stripe_subscription_id,
            status = %payload.status,
            "Subscription mirrored"
        );

        let renewed = detect_renewal
            && previous_start.is_some_and(|prev| prev != payload.current_period_start);
        if renewed {
            let cycles = self.cycles.clone();
            tokio::spawn(async move {
                if let Err(e) = cycles.reset_token_credit(subscription_id).await {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to reset token credit after renewal"
                    );
                }
            });
        }

        Ok(())
    }

    async fn handle_subscription_deleted(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<()> {
        // Cycles are left as-is: history is preserved, and the usage
        // recorder's active-subscription filter stops new cycles.
        let updated = self
            .subscriptions
            .set_status_by_stripe_id(stripe_subscription_id, SubscriptionStatus::Canceled)
            .await?;

        if updated {
            tracing::info!(
                stripe_subscription_id = %stripe_subscription_id,
                "Subscription canceled"
            );
        } else {
            tracing::warn!(
                stripe_subscription_id = %stripe_subscription_id,
                "Deletion event for unknown subscription"
            );
        }

        Ok(())
    }

    async fn handle_invoice_payment_succeeded(
        &self,
        stripe_invoice_id: &str,
        stripe_subscription_id: Option<String>,
    ) -> BillingResult<()> {
        let Some(stripe_subscription_id) = stripe_subscription_id else {
            // One-off invoice (e.g. an overage invoice this core issued);
            // there is no cycle to roll over.
            tracing::info!(
                stripe_invoice_id = %stripe_invoice_id,
                "Invoice paid without subscription, nothing to roll over"
            );
            return Ok(());
        };

        let Some(subscription) = self
            .subscriptions
            .get_by_stripe_id(&stripe_subscription_id)
            .await?
        else {
            tracing::warn!(
                stripe_subscription_id = %stripe_subscription_id,
                "Invoice paid for unknown subscription"
            );
            return Ok(());
        };

        let attached = self
            .cycles
            .attach_invoice(subscription.id, stripe_invoice_id)
            .await?;
        if attached {
            tracing::info!(
                subscription_id = %subscription.id,
                stripe_invoice_id = %stripe_invoice_id,
                "Attached invoice to active billing cycle"
            );
        }

        self.cycles.reset_token_credit(subscription.id).await?;
        Ok(())
    }

    async fn handle_invoice_payment_failed(
        &self,
        stripe_subscription_id: Option<String>,
    ) -> BillingResult<()> {
        let Some(stripe_subscription_id) = stripe_subscription_id else {
            return Ok(());
        };

        // Status flag only; usage keeps accruing and consuming policies
        // decide how to treat past_due users.
        let updated = self
            .subscriptions
            .set_status_by_stripe_id(&stripe_subscription_id, SubscriptionStatus::PastDue)
            .await?;

        if updated {
            tracing::warn!(
                stripe_subscription_id = %stripe_subscription_id,
                "Subscription marked past_due after failed payment"
            );
        }

        Ok(())
    }

    /// Resolve the owning user from customer metadata when the
    /// subscription itself carries none. Retried with backoff; transient
    /// provider failures should not drop a lifecycle event.
    async fn resolve_user_from_customer(&self, stripe_customer_id: &str) -> BillingResult<Uuid> {
        let customer_id = stripe_customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {e}")))?;

        let customer = retry::with_backoff(&self.retry_policy, || {
            Customer::retrieve(self.stripe.inner(), &customer_id, &[])
        })
        .await?;

        customer
            .metadata
            .as_ref()
            .and_then(|metadata| user_id_from_metadata(metadata))
            .ok_or_else(|| {
                BillingError::EventPayloadInvalid(format!(
                    "no user_id in subscription or customer metadata for {stripe_customer_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_collapses_provider_space() {
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Unpaid),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Canceled),
            SubscriptionStatus::Canceled
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn test_included_credit_defaults_without_metadata() {
        let metadata = HashMap::new();
        assert_eq!(
            included_credit_from_metadata(&metadata),
            DEFAULT_INCLUDED_CREDIT_USD
        );
    }

    #[test]
    fn test_included_credit_parses_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert("included_credit_usd".to_string(), "25.0".to_string());
        assert_eq!(included_credit_from_metadata(&metadata), 25.0);

        metadata.insert("included_credit_usd".to_string(), "not a number".to_string());
        assert_eq!(
            included_credit_from_metadata(&metadata),
            DEFAULT_INCLUDED_CREDIT_USD
        );
    }

    #[test]
    fn test_user_id_from_metadata() {
        let mut metadata = HashMap::new();
        assert_eq!(user_id_from_metadata(&metadata), None);

        let user_id = Uuid::new_v4();
        metadata.insert("user_id".to_string(), user_id.to_string());
        assert_eq!(user_id_from_metadata(&metadata), Some(user_id));

        metadata.insert("user_id".to_string(), "not-a-uuid".to_string());
        assert_eq!(user_id_from_metadata(&metadata), None);
    }

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1700000000,v1=abc123,v0=ignored");
        assert_eq!(parsed, Some((1_700_000_000, "abc123".to_string())));

        assert_eq!(parse_signature_header("v1=abc123"), None);
        assert_eq!(parse_signature_header("t=1700000000"), None);
        assert_eq!(parse_signature_header(""), None);
    }
}
