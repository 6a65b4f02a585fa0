//! Core billing domain types.
//!
//! Statuses are stored as lowercase text in Postgres; the enums here parse
//! from and render to exactly those strings.

use serde::{Deserialize, Serialize};

/// Free-tier token ceiling per conversation.
///
/// The free tier does not roll billing cycles; this is a lifetime cap on
/// each conversation.
pub const FREE_TIER_TOKEN_LIMIT: i64 = 20_000;

/// Maximum number of conversations a free-tier user may create.
/// Checked at conversation-create time, not on token usage.
pub const FREE_TIER_MAX_CONVERSATIONS: i64 = 5;

/// Mirrored external subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Billing cycle lifecycle status.
///
/// A cycle transitions `Active -> Completed` exactly once and never
/// reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Active,
    Completed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Active => "active",
            CycleStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CycleStatus::Active),
            "completed" => Ok(CycleStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Error for an unrecognized status string coming out of storage.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trips() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(
                SubscriptionStatus::from_str(status.as_str()).ok(),
                Some(status)
            );
        }
        for status in [CycleStatus::Active, CycleStatus::Completed] {
            assert_eq!(CycleStatus::from_str(status.as_str()).ok(), Some(status));
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(SubscriptionStatus::from_str("trialing").is_err());
        assert!(CycleStatus::from_str("open").is_err());
    }
}
