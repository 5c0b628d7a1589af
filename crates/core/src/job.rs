//! The queued job record: an immutable [`RenderJob`] plus its queue state and
//! the render outcome that workers and reviewers update.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::perceptual_hash::PerceptualHash;
use crate::render::RenderJob;
use crate::scheduling::{JobState, DEFAULT_MAX_ATTEMPTS};
use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Render-level statuses
// ---------------------------------------------------------------------------

/// Status of the render as the product sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Quality disposition of the render's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Pending,
    Approved,
    Rejected,
}

macro_rules! impl_wire_name {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(CoreError::Validation(format!(
                        concat!("Unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

impl_wire_name!(RenderStatus {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl_wire_name!(QualityStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Error written on jobs cancelled before a worker picked them up.
pub const CANCELLED_ERROR: &str = "Cancelled before processing started";

/// Error written on jobs given up on by stalled-job recovery.
pub const STALLED_ERROR: &str = "Job stalled and exhausted its attempts";

// ---------------------------------------------------------------------------
// RenderOutcome
// ---------------------------------------------------------------------------

/// What the render produced so far. Updated by workers and review actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutcome {
    pub render_status: RenderStatus,
    pub quality_status: QualityStatus,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub quality_score: Option<f64>,
    pub perceptual_hash: Option<PerceptualHash>,
    pub error: Option<String>,
}

impl Default for RenderOutcome {
    fn default() -> Self {
        Self {
            render_status: RenderStatus::Queued,
            quality_status: QualityStatus::Pending,
            image_url: None,
            thumbnail_url: None,
            quality_score: None,
            perceptual_hash: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: RenderJob,
    pub state: JobState,
    pub priority: i32,
    /// Attempts started so far; incremented on each claim.
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Credits consumed at submission.
    pub cost: u32,
    pub submitted_at: Timestamp,
    /// Earliest time the job may be claimed.
    pub run_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub outcome: RenderOutcome,
}

impl JobRecord {
    /// A freshly submitted job, ready to run immediately.
    pub fn new(job: RenderJob, cost: u32, submitted_at: Timestamp) -> Self {
        Self {
            priority: job.subscription_tier.queue_priority(),
            job,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            cost,
            submitted_at,
            run_at: submitted_at,
            started_at: None,
            finished_at: None,
            worker_id: None,
            lease_expires_at: None,
            outcome: RenderOutcome::default(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn id(&self) -> &EntityId {
        &self.job.id
    }

    /// Whether a worker may claim the job at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.run_at <= now
    }
}

/// Serving order: lower priority value first, then earlier submission.
pub fn dispatch_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.job.id.cmp(&b.job.id))
}
