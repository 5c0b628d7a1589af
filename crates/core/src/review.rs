//! Review disposition rules and the quality review state machine.
//!
//! A review's status is decided once when it is created (auto-approved,
//! rejected, or pending) and afterwards only a human can move a `pending`
//! review to `approved` or `rejected`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::quality::QualityMetadata;
use crate::render::RenderSettings;
use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Scores at or above this are approved without human review.
pub const AUTO_APPROVE_THRESHOLD: f64 = 0.85;

/// Scores at or below this are rejected without human review.
pub const AUTO_REJECT_THRESHOLD: f64 = 0.5;

/// Requested quality above which a render always goes to a human.
pub const MANUAL_REVIEW_QUALITY: u8 = 75;

/// Maximum length of reviewer notes.
pub const MAX_REVIEW_NOTES_LENGTH: usize = 5_000;

// ---------------------------------------------------------------------------
// ReviewStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::AutoApproved => "auto_approved",
        }
    }

    /// Only `pending` reviews accept a human decision.
    pub fn can_transition_to(self, to: ReviewStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Approved) | (Self::Pending, Self::Rejected)
        )
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "auto_approved" => Ok(Self::AutoApproved),
            other => Err(CoreError::Validation(format!(
                "Invalid review status '{other}'. Must be one of: pending, approved, rejected, auto_approved"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// Status a new review starts in.
///
/// A render that failed its quality check is rejected regardless of the
/// manual-review flag; otherwise a forced review stays `pending` and the
/// score thresholds decide the rest.
///
/// `passed` is false when a check reported an issue or the score is below
/// the pass mark, so the image is already known to be unusable and there is
/// nothing for a reviewer to approve.
pub fn decide_initial_status(
    score: f64,
    passed: bool,
    force_manual_review: bool,
) -> ReviewStatus {
    if !passed {
        return ReviewStatus::Rejected;
    }
    if force_manual_review {
        return ReviewStatus::Pending;
    }
    if score >= AUTO_APPROVE_THRESHOLD {
        ReviewStatus::AutoApproved
    } else if score <= AUTO_REJECT_THRESHOLD {
        ReviewStatus::Rejected
    } else {
        ReviewStatus::Pending
    }
}

/// Whether a render must be reviewed by a human regardless of its score.
///
/// `attempt` is 1-based; any retry forces manual review.
pub fn requires_manual_review(flag: bool, attempt: u32, settings: &RenderSettings) -> bool {
    flag || attempt > 1 || settings.quality > MANUAL_REVIEW_QUALITY
}

// ---------------------------------------------------------------------------
// QualityReview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReview {
    pub id: EntityId,
    pub render_id: EntityId,
    pub project_id: EntityId,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub quality_score: f64,
    pub issues: Vec<String>,
    pub status: ReviewStatus,
    pub reviewed_by: Option<EntityId>,
    pub reviewed_at: Option<Timestamp>,
    pub review_notes: Option<String>,
    pub metadata: QualityMetadata,
    pub created_at: Timestamp,
}

/// A human decision applied to a pending review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub status: ReviewStatus,
    pub reviewer: EntityId,
    pub notes: Option<String>,
    pub decided_at: Timestamp,
}

impl ReviewDecision {
    pub fn approve(reviewer: impl Into<EntityId>, notes: Option<String>, at: Timestamp) -> Self {
        Self {
            status: ReviewStatus::Approved,
            reviewer: reviewer.into(),
            notes,
            decided_at: at,
        }
    }

    pub fn reject(reviewer: impl Into<EntityId>, notes: impl Into<String>, at: Timestamp) -> Self {
        Self {
            status: ReviewStatus::Rejected,
            reviewer: reviewer.into(),
            notes: Some(notes.into()),
            decided_at: at,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.reviewer.trim().is_empty() {
            return Err(CoreError::Validation("Reviewer must not be empty".to_string()));
        }
        if let Some(notes) = &self.notes {
            if notes.len() > MAX_REVIEW_NOTES_LENGTH {
                return Err(CoreError::Validation(format!(
                    "Review notes exceed maximum length of {MAX_REVIEW_NOTES_LENGTH} characters"
                )));
            }
        }
        if self.status == ReviewStatus::Rejected
            && self.notes.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(CoreError::Validation(
                "Rejecting a review requires notes".to_string(),
            ));
        }
        Ok(())
    }
}

impl QualityReview {
    /// Apply a human decision, enforcing the state machine.
    pub fn apply(&mut self, decision: &ReviewDecision) -> Result<(), CoreError> {
        decision.validate()?;
        if !self.status.can_transition_to(decision.status) {
            return Err(CoreError::Conflict(format!(
                "Review {} is '{}' and cannot become '{}'",
                self.id, self.status, decision.status
            )));
        }
        self.status = decision.status;
        self.reviewed_by = Some(decision.reviewer.clone());
        self.reviewed_at = Some(decision.decided_at);
        self.review_notes = decision.notes.clone();
        Ok(())
    }
}
