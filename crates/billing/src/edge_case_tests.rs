// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Boundary conditions across:
//! - Credit limiter decisions (paid and free tier)
//! - Overage rounding and the minimum-invoice threshold
//! - Batch run accounting and failure isolation
//! - Cycle overage ledger law

#[cfg(test)]
mod limiter_edge_cases {
    use crate::limits::*;
    use arbor_shared::types::FREE_TIER_TOKEN_LIMIT;

    // =========================================================================
    // Paid user at exactly zero remaining credit - next request denied
    // =========================================================================
    #[test]
    fn test_zero_remaining_credit_denies_next_request() {
        // Cost exactly equals credit: remaining is 0, any estimate > 0
        // pushes it negative.
        let check = evaluate_paid(0.0, estimated_cost(1, 0.06));
        assert!(!check.allowed, "zero remaining credit should deny");
        assert_eq!(check.reason, Some(REASON_CREDIT_EXCEEDED));
    }

    // =========================================================================
    // Overdrawn cycle (cost 12.5, credit 10) - probe allowed, request denied
    // =========================================================================
    #[test]
    fn test_overdrawn_cycle_probe_vs_request() {
        let probe = evaluate_paid(-2.5, estimated_cost(0, 0.06));
        assert!(probe.allowed, "zero-token probe should report, not deny");
        assert_eq!(probe.remaining_credit, Some(-2.5));

        let request = evaluate_paid(-2.5, estimated_cost(100, 0.06));
        assert!(!request.allowed, "any non-zero request must be denied");
    }

    // =========================================================================
    // Free tier at 19000/20000 requesting 2000 - denied
    // =========================================================================
    #[test]
    fn test_free_tier_over_ceiling_denied() {
        let check = evaluate_free(19_000, false, 2_000, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(REASON_FREE_TIER_LIMIT));
    }

    // =========================================================================
    // Free tier request landing exactly on the ceiling - allowed
    // =========================================================================
    #[test]
    fn test_free_tier_exactly_at_ceiling_allowed() {
        let check = evaluate_free(19_000, false, 1_000, FREE_TIER_TOKEN_LIMIT);
        assert!(check.allowed, "20000 of 20000 is within the ceiling");
    }

    // =========================================================================
    // Fresh free conversation with a huge single request - denied up front
    // =========================================================================
    #[test]
    fn test_free_tier_single_oversized_request_denied() {
        let check = evaluate_free(0, false, 25_000, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed);
        assert_eq!(check.tokens_used, Some(0));
    }

    // =========================================================================
    // Locked conversation stays denied even for tiny requests
    // =========================================================================
    #[test]
    fn test_locked_conversation_denied() {
        let check = evaluate_free(20_000, true, 1, FREE_TIER_TOKEN_LIMIT);
        assert!(!check.allowed);
    }
}

#[cfg(test)]
mod invoicing_edge_cases {
    use crate::invoicing::*;
    use uuid::Uuid;

    // =========================================================================
    // Rounding law: cents == round(overage x 100), half-up
    // =========================================================================
    #[test]
    fn test_rounding_law() {
        assert_eq!(overage_cents(1.999), 200);
        assert_eq!(overage_cents(2.5), 250);
        assert_eq!(overage_cents(2.004), 200);
        assert_eq!(overage_cents(2.005), 201);
    }

    // =========================================================================
    // Threshold law: exactly 0.50 never invoiced, 0.51 is
    // =========================================================================
    #[test]
    fn test_threshold_law() {
        let min = InvoicePolicy::default().min_invoice_usd;
        assert!(!should_invoice(0.50, min), "exactly 0.50 is written off");
        assert!(should_invoice(0.51, min), "0.51 must be invoiced");
    }

    // =========================================================================
    // A written-off cycle is processed but not invoiced and not an error
    // =========================================================================
    #[test]
    fn test_below_threshold_counts_as_processed_only() {
        let outcomes = vec![CycleOutcome::BelowThreshold {
            cycle_id: Uuid::new_v4(),
            overage: 0.25,
        }];
        let summary = OverageRunSummary::from_outcomes(&outcomes);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.invoiced, 0);
        assert_eq!(summary.errors, 0);
    }

    // =========================================================================
    // Two expired cycles, first fails, second succeeds:
    // {processed: 2, invoiced: 1, errors: 1}
    // =========================================================================
    #[test]
    fn test_failure_isolation_accounting() {
        let outcomes = vec![
            CycleOutcome::Error {
                cycle_id: Uuid::new_v4(),
                error: "invoice item creation failed".to_string(),
            },
            CycleOutcome::Invoiced {
                cycle_id: Uuid::new_v4(),
                invoice_id: "in_test_456".to_string(),
                amount_cents: 250,
            },
        ];
        let summary = OverageRunSummary::from_outcomes(&outcomes);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.invoiced, 1);
        assert_eq!(summary.errors, 1);
    }

    // =========================================================================
    // Expired cycle with overage 2.5 invoices 250 cents
    // =========================================================================
    #[test]
    fn test_two_fifty_overage_invoices_250_cents() {
        assert!(should_invoice(2.5, InvoicePolicy::default().min_invoice_usd));
        assert_eq!(overage_cents(2.5), 250);
    }
}

#[cfg(test)]
mod cycle_edge_cases {
    use crate::cycles::overage_for;

    // =========================================================================
    // Overage ledger law: overage == max(0, cost - credit)
    // =========================================================================
    #[test]
    fn test_overage_ledger_law() {
        assert_eq!(overage_for(0.0, 10.0), 0.0);
        assert_eq!(overage_for(9.999, 10.0), 0.0);
        assert_eq!(overage_for(10.0, 10.0), 0.0);
        assert!((overage_for(12.5, 10.0) - 2.5).abs() < 1e-12);
    }

    // =========================================================================
    // Zero-credit subscription: every cent of cost is overage
    // =========================================================================
    #[test]
    fn test_zero_credit_all_cost_is_overage() {
        assert!((overage_for(3.25, 0.0) - 3.25).abs() < 1e-12);
    }
}

#[cfg(test)]
mod policy_edge_cases {
    use crate::invoicing::InvoicePolicy;
    use crate::retry::RetryPolicy;
    use serial_test::serial;

    // =========================================================================
    // Policy values are env-configurable with the stock defaults
    // =========================================================================
    #[test]
    #[serial]
    fn test_invoice_policy_default_when_env_unset() {
        if std::env::var("OVERAGE_MIN_INVOICE_USD").is_err() {
            assert_eq!(InvoicePolicy::from_env().min_invoice_usd, 0.50);
        }
    }

    #[test]
    #[serial]
    fn test_retry_policy_default_when_env_unset() {
        if std::env::var("STRIPE_RETRY_COUNT").is_err() {
            let policy = RetryPolicy::from_env();
            assert_eq!(policy.max_retries, 3);
            assert_eq!(policy.base_delay_ms, 100);
        }
    }
}
