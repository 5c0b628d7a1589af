//! Render queue state machine, retry backoff, and retention rules.
//!
//! Lives in `core` so both store implementations and the worker share one
//! definition of which transitions are legal and when a job is retried.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Attempts a job gets before it fails permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles on each subsequent retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// How long a claimed job may stay active before it counts as stalled.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Queue-level state of a render job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Waiting for its retry time to pass.
    Delayed,
    /// Claimed by a worker.
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// States that count against a user's submission rate limits.
    pub const IN_FLIGHT: [JobState; 3] = [Self::Active, Self::Waiting, Self::Delayed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job in this state may still be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    pub fn valid_transitions(self) -> &'static [JobState] {
        match self {
            Self::Waiting => &[Self::Active, Self::Cancelled],
            Self::Delayed => &[Self::Active, Self::Waiting, Self::Cancelled],
            Self::Active => &[Self::Completed, Self::Failed, Self::Delayed, Self::Waiting],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: JobState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn validate_transition(self, to: JobState) -> Result<(), CoreError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "Invalid job transition: {self} -> {to}"
            )))
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::Validation(format!("Unknown job state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why a render attempt failed. Retry and refund decisions are made on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Provider timeout, 5xx, 429, or a storage hiccup.
    Transient,
    /// The provider refused the request (bad prompt, policy violation).
    Validation,
    /// The render did not pass the quality check.
    QualityRejected,
    /// The render is near-identical to a recent one.
    DuplicateDetected,
    /// Anything else; surfaced to the operator without retry.
    Internal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::QualityRejected => "quality_rejected",
            Self::DuplicateDetected => "duplicate_detected",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for failed attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Factor applied per additional failed attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_BACKOFF,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Grow `current` by the policy multiplier, clamped to `max_delay`.
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

impl RetryPolicy {
    /// Delay before retrying after `attempts_made` attempts have failed.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempts_made.max(1) {
            delay = next_delay(delay, self);
        }
        delay
    }

    /// What to do with a job whose latest attempt failed with `kind`.
    pub fn decide(&self, kind: FailureKind, attempts_made: u32) -> RetryDecision {
        if kind.is_retryable() && attempts_made < self.max_attempts {
            RetryDecision::Retry {
                delay: self.delay_after(attempts_made),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// How long finished jobs of one state are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    /// At most this many of the newest jobs are kept.
    pub max_count: usize,
}

impl RetentionPolicy {
    /// Completed jobs: one hour, newest 100.
    pub const COMPLETED: RetentionPolicy = RetentionPolicy {
        max_age: Duration::from_secs(60 * 60),
        max_count: 100,
    };

    /// Failed jobs: seven days, newest 1000.
    pub const FAILED: RetentionPolicy = RetentionPolicy {
        max_age: Duration::from_secs(7 * 24 * 60 * 60),
        max_count: 1000,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- state machine ------------------------------------------------------

    #[test]
    fn waiting_can_be_claimed_or_cancelled() {
        assert!(JobState::Waiting.can_transition_to(JobState::Active));
        assert!(JobState::Waiting.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Waiting.can_transition_to(JobState::Completed));
    }

    #[test]
    fn active_cannot_be_cancelled() {
        assert!(!JobState::Active.is_cancellable());
        assert!(JobState::Active.validate_transition(JobState::Cancelled).is_err());
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(state.is_terminal());
            assert!(state.valid_transitions().is_empty());
        }
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Waiting,
            JobState::Delayed,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
    }

    // -- retry --------------------------------------------------------------

    #[test]
    fn backoff_starts_at_one_second_and_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_clamps_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(3),
            ..Default::default()
        };
        assert_eq!(policy.delay_after(10), Duration::from_secs(3));
    }

    #[test]
    fn transient_failures_retry_until_budget_spent() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureKind::Transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(FailureKind::Transient, 2),
            RetryDecision::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.decide(FailureKind::Transient, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn non_transient_failures_never_retry() {
        let policy = RetryPolicy::default();
        for kind in [
            FailureKind::Validation,
            FailureKind::QualityRejected,
            FailureKind::DuplicateDetected,
            FailureKind::Internal,
        ] {
            assert_eq!(policy.decide(kind, 1), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn retention_defaults() {
        assert_eq!(RetentionPolicy::COMPLETED.max_count, 100);
        assert_eq!(RetentionPolicy::FAILED.max_age, Duration::from_secs(604_800));
    }
}
