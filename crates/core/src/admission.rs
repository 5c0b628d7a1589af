//! Sliding-window submission limits.
//!
//! The decision is a pure function of the tier and the number of in-flight
//! jobs the user submitted inside each window; counting is the caller's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tier::SubscriptionTier;
use crate::types::Timestamp;

/// Short window, checked first.
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Long window, checked when the short one has room.
pub const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Start of the minute and hour windows ending at `now`.
pub fn window_starts(now: Timestamp) -> (Timestamp, Timestamp) {
    let minute = chrono::Duration::from_std(MINUTE_WINDOW).unwrap_or_default();
    let hour = chrono::Duration::from_std(HOUR_WINDOW).unwrap_or_default();
    (now - minute, now - hour)
}

/// Decide admission from the user's in-flight counts in each window.
pub fn evaluate(
    tier: SubscriptionTier,
    in_last_minute: u64,
    in_last_hour: u64,
) -> AdmissionDecision {
    let limits = tier.rate_limits();

    if in_last_minute >= u64::from(limits.per_minute) {
        return AdmissionDecision::deny(format!(
            "Rate limit exceeded: maximum {} renders per minute for {tier} tier",
            limits.per_minute
        ));
    }
    if in_last_hour >= u64::from(limits.per_hour) {
        return AdmissionDecision::deny(format!(
            "Rate limit exceeded: maximum {} renders per hour for {tier} tier",
            limits.per_hour
        ));
    }
    AdmissionDecision::allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_third_submission_in_a_minute_is_denied() {
        let tier = SubscriptionTier::Starter;
        assert!(evaluate(tier, 0, 0).allowed);
        assert!(evaluate(tier, 1, 1).allowed);

        let third = evaluate(tier, 2, 2);
        assert!(!third.allowed);
        assert!(third.reason.unwrap().contains("minute"));
    }

    #[test]
    fn hour_window_checked_after_minute() {
        let denied = evaluate(SubscriptionTier::Pro, 3, 100);
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("hour"));
    }

    #[test]
    fn minute_reason_wins_when_both_exceeded() {
        let denied = evaluate(SubscriptionTier::Growth, 20, 300);
        assert!(denied.reason.unwrap().contains("minute"));
    }

    #[test]
    fn windows_end_at_now() {
        let now = chrono::Utc::now();
        let (minute_ago, hour_ago) = window_starts(now);
        assert_eq!(now - minute_ago, chrono::Duration::seconds(60));
        assert_eq!(now - hour_ago, chrono::Duration::seconds(3600));
    }

    #[test]
    fn allowed_decision_has_no_reason() {
        let json = serde_json::to_value(AdmissionDecision::allow()).unwrap();
        assert_eq!(json, serde_json::json!({"allowed": true}));
    }
}
