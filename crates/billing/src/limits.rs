//! Admission control: token and conversation limits.
//!
//! Pure reads consulted before a model request is issued. These checks are
//! advisory: the request path fails open on storage errors (a stale read
//! must not block legitimate traffic), and the overage invoicing engine is
//! the authoritative backstop that reconciles actual cost.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use arbor_shared::types::{FREE_TIER_MAX_CONVERSATIONS, FREE_TIER_TOKEN_LIMIT};
use arbor_shared::DEFAULT_COST_ESTIMATE_PER_1K;

use crate::error::BillingResult;
use crate::subscriptions::SubscriptionService;

pub const REASON_CREDIT_EXCEEDED: &str = "credit_exceeded";
pub const REASON_FREE_TIER_LIMIT: &str = "free_tier_limit_exceeded";
pub const REASON_CONVERSATION_LIMIT: &str = "conversation_limit_exceeded";

/// Result of an admission check. The reason string is typed for the caller
/// to map to an upgrade prompt.
#[derive(Debug, Clone, Serialize)]
pub struct TokenLimitCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Paid tier: included credit minus cost accrued this cycle. May be
    /// negative once overage has accrued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_credit: Option<f64>,
    /// Free tier: cumulative tokens used in the conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i64>,
}

impl TokenLimitCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            remaining_credit: None,
            tokens_used: None,
        }
    }
}

#[derive(Clone)]
pub struct TokenLimiter {
    pool: PgPool,
    subscriptions: SubscriptionService,
    /// Conservative USD cost estimate per 1K requested tokens.
    estimate_per_1k: f64,
}

impl TokenLimiter {
    pub fn new(pool: PgPool) -> Self {
        let estimate_per_1k = std::env::var("LIMITER_COST_ESTIMATE_PER_1K")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_COST_ESTIMATE_PER_1K);

        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            pool,
            subscriptions,
            estimate_per_1k,
        }
    }

    /// Decide whether a request for `requested_tokens` may proceed.
    ///
    /// Paid users are gated on remaining cycle credit; free users on the
    /// per-conversation token ceiling. A paid user with no cycle yet is
    /// allowed (the cycle is created lazily on first usage).
    pub async fn check_token_limit(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        requested_tokens: i64,
    ) -> BillingResult<TokenLimitCheck> {
        if self
            .subscriptions
            .get_active_for_user(user_id)
            .await?
            .is_some()
        {
            let cycle: Option<(f64, f64)> = sqlx::query_as(
                "SELECT token_cost, included_credit FROM billing_cycles \
                 WHERE user_id = $1 AND status = 'active'",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            let check = match cycle {
                Some((token_cost, included_credit)) => evaluate_paid(
                    included_credit - token_cost,
                    estimated_cost(requested_tokens, self.estimate_per_1k),
                ),
                None => TokenLimitCheck::allowed(),
            };
            return Ok(check);
        }

        let usage: Option<(i64, bool)> = sqlx::query_as(
            "SELECT tokens_used, locked FROM free_tier_usage WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        let (tokens_used, locked) = usage.unwrap_or((0, false));
        Ok(evaluate_free(
            tokens_used,
            locked,
            requested_tokens,
            FREE_TIER_TOKEN_LIMIT,
        ))
    }

    /// Fail-open wrapper for the request path: a storage error is logged
    /// and the request allowed. Recording and reconciliation still see the
    /// real numbers.
    pub async fn check_token_limit_or_allow(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        requested_tokens: i64,
    ) -> TokenLimitCheck {
        match self
            .check_token_limit(user_id, conversation_id, requested_tokens)
            .await
        {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    error = %e,
                    "Token limit check failed, allowing request"
                );
                TokenLimitCheck::allowed()
            }
        }
    }

    /// Gate conversation creation for free-tier users.
    ///
    /// Counts conversations with recorded free-tier usage; subscribed
    /// users have no conversation ceiling.
    pub async fn check_conversation_limit(&self, user_id: Uuid) -> BillingResult<TokenLimitCheck> {
        if self
            .subscriptions
            .get_active_for_user(user_id)
            .await?
            .is_some()
        {
            return Ok(TokenLimitCheck::allowed());
        }

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM free_tier_usage WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        if count >= FREE_TIER_MAX_CONVERSATIONS {
            Ok(TokenLimitCheck {
                allowed: false,
                reason: Some(REASON_CONVERSATION_LIMIT),
                remaining_credit: None,
                tokens_used: None,
            })
        } else {
            Ok(TokenLimitCheck::allowed())
        }
    }
}

/// Estimated USD cost for a requested token count.
pub(crate) fn estimated_cost(requested_tokens: i64, estimate_per_1k: f64) -> f64 {
    (requested_tokens.max(0) as f64 / 1000.0) * estimate_per_1k
}

/// Paid-tier decision. A zero-token request is a status probe and always
/// passes, reporting the (possibly negative) remaining credit; a non-zero
/// request is denied once the estimate would push remaining credit below
/// zero.
pub(crate) fn evaluate_paid(remaining_credit: f64, estimated_cost: f64) -> TokenLimitCheck {
    let allowed = estimated_cost <= 0.0 || remaining_credit - estimated_cost >= 0.0;
    TokenLimitCheck {
        allowed,
        reason: (!allowed).then_some(REASON_CREDIT_EXCEEDED),
        remaining_credit: Some(remaining_credit),
        tokens_used: None,
    }
}

/// Free-tier decision: deny once the conversation is locked or the request
/// would push cumulative tokens past the ceiling.
pub(crate) fn evaluate_free(
    tokens_used: i64,
    locked: bool,
    requested_tokens: i64,
    ceiling: i64,
) -> TokenLimitCheck {
    let allowed = !locked && tokens_used + requested_tokens <= ceiling;
    TokenLimitCheck {
        allowed,
        reason: (!allowed).then_some(REASON_FREE_TIER_LIMIT),
        remaining_credit: None,
        tokens_used: Some(tokens_used),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paid_zero_token_probe_reports_negative_credit() {
        // Cycle with cost 12.5 against credit 10: overage already accrued.
        let check = evaluate_paid(10.0 - 12.5, estimated_cost(0, 0.06));
        assert!(check.allowed, "status probe should pass");
        assert_eq!(check.remaining_credit, Some(-2.5));
    }

    #[test]
    fn test_paid_overdrawn_denies_nonzero_request() {
        let check = evaluate_paid(10.0 - 12.5, estimated_cost(1000, 0.06));
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(REASON_CREDIT_EXCEEDED));
        assert_eq!(check.remaining_credit, Some(-2.5));
    }

    #[test]
    fn test_paid_within_credit_allowed() {
        let check = evaluate_paid(5.0, estimated_cost(2000, 0.06));
        assert!(check.allowed);
        assert_eq!(check.reason, None);
    }

    #[test]
    fn test_paid_denies_exactly_at_shortfall() {
        // remaining 0.05, estimate 0.06 per 1K: 1K tokens is 0.01 short.
        let check = evaluate_paid(0.05, estimated_cost(1000, 0.06));
        assert!(!check.allowed);

        // An estimate that lands exactly on the remaining credit passes.
        let check = evaluate_paid(0.06, estimated_cost(1000, 0.06));
        assert!(check.allowed);
    }

    #[test]
    fn test_free_tier_denies_past_ceiling() {
        // 19000 used + 2000 requested > 20000 ceiling.
        let check = evaluate_free(19_000, false, 2_000, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(REASON_FREE_TIER_LIMIT));
        assert_eq!(check.tokens_used, Some(19_000));
    }

    #[test]
    fn test_free_tier_allows_exactly_at_ceiling() {
        let check = evaluate_free(19_000, false, 1_000, FREE_TIER_TOKEN_LIMIT);
        assert!(check.allowed, "landing exactly on the ceiling is allowed");

        let check = evaluate_free(19_000, false, 1_001, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed, "one token past the ceiling is denied");
    }

    #[test]
    fn test_free_tier_locked_conversation_denied() {
        let check = evaluate_free(100, true, 1, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(REASON_FREE_TIER_LIMIT));
    }

    #[test]
    fn test_estimated_cost() {
        assert!((estimated_cost(2000, 0.06) - 0.12).abs() < 1e-12);
        assert_eq!(estimated_cost(0, 0.06), 0.0);
        assert_eq!(estimated_cost(-5, 0.06), 0.0);
    }
}
