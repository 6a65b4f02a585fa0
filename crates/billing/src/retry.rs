//! Retry with exponential backoff for direct-path Stripe calls.
//!
//! The batch invoicing engine deliberately does not use this: its retry
//! mechanism is the next scheduled run. Lifecycle handlers and other
//! request-adjacent calls retry transient failures a small number of times,
//! skipping 4xx client errors which are permanent.

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Retry policy for Stripe calls on the webhook/lifecycle path.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub max_retries: usize,
    /// Delay factor in milliseconds; retries back off at 2x, 4x, 8x this.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Load the policy from environment or use defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: std::env::var("STRIPE_RETRY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            base_delay_ms: std::env::var("STRIPE_RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.base_delay_ms),
        }
    }
}

/// Whether a Stripe error is worth retrying.
///
/// 4xx responses are client errors and will fail identically on retry;
/// everything else (5xx, 429, transport failures, timeouts) is transient.
pub fn is_retryable(err: &stripe::StripeError) -> bool {
    match err {
        stripe::StripeError::Stripe(request_err) => {
            request_err.http_status == 429 || request_err.http_status >= 500
        }
        stripe::StripeError::ClientError(_) | stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Run a Stripe call with exponential backoff, retrying only transient
/// failures.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, stripe::StripeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, stripe::StripeError>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(policy.base_delay_ms)
        .map(jitter)
        .take(policy.max_retries);

    RetryIf::spawn(strategy, operation, is_retryable).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_error(status: u16) -> stripe::StripeError {
        let mut err: stripe::RequestError =
            serde_json::from_str(r#"{"type": "api_error"}"#).unwrap();
        err.http_status = status;
        stripe::StripeError::Stripe(err)
    }

    #[test]
    fn test_client_errors_not_retryable() {
        assert!(!is_retryable(&request_error(400)));
        assert!(!is_retryable(&request_error(404)));
    }

    #[test]
    fn test_server_errors_and_rate_limits_retryable() {
        assert!(is_retryable(&request_error(500)));
        assert!(is_retryable(&request_error(503)));
        assert!(is_retryable(&request_error(429)));
    }

    #[test]
    fn test_timeout_retryable() {
        assert!(is_retryable(&stripe::StripeError::Timeout));
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_permanent_error() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 1,
        };
        let mut attempts = 0u32;
        let result: Result<(), _> = with_backoff(&policy, || {
            attempts += 1;
            async { Err(request_error(400)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1, "4xx should not be retried");
    }

    #[tokio::test]
    async fn test_backoff_retries_transient_errors() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
        };
        let mut attempts = 0u32;
        let result: Result<u32, _> = with_backoff(&policy, || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(stripe::StripeError::Timeout)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(3));
    }
}
