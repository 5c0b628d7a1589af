//! Per-user submission rate limiting.
//!
//! The windows are computed from stored job state on every call, so every
//! API process sees the same counts without a shared in-memory map.

use std::sync::Arc;

use chrono::Utc;
use verdant_core::admission::{self, AdmissionDecision};
use verdant_core::scheduling::JobState;
use verdant_core::store::JobStore;
use verdant_core::tier::SubscriptionTier;

use crate::error::PipelineError;

pub struct AdmissionController {
    jobs: Arc<dyn JobStore>,
}

impl AdmissionController {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Whether `user_id` may submit another render now. Read-only.
    pub async fn can_submit(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
    ) -> Result<AdmissionDecision, PipelineError> {
        let (minute_ago, hour_ago) = admission::window_starts(Utc::now());

        let in_last_minute = self
            .jobs
            .count_user_jobs_since(user_id, &JobState::IN_FLIGHT, minute_ago)
            .await?;
        let in_last_hour = self
            .jobs
            .count_user_jobs_since(user_id, &JobState::IN_FLIGHT, hour_ago)
            .await?;

        let decision = admission::evaluate(tier, in_last_minute, in_last_hour);
        if !decision.allowed {
            tracing::info!(
                user_id,
                tier = %tier,
                in_last_minute,
                in_last_hour,
                "Submission rate limited",
            );
        }
        Ok(decision)
    }
}
