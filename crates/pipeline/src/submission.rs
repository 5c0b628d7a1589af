//! Submission flow: validate, admit, charge, enqueue.

use std::sync::Arc;

use verdant_core::admission::AdmissionDecision;
use verdant_core::credits::ConsumeOutcome;
use verdant_core::render::{RenderJob, RenderRequest, Submitter};

use crate::admission::AdmissionController;
use crate::error::SubmissionError;
use crate::ledger::{Charge, CreditLedger};
use crate::queue::{Enqueued, JobHandle, RenderQueue};

pub struct SubmissionService {
    admission: Arc<AdmissionController>,
    ledger: Arc<CreditLedger>,
    queue: Arc<RenderQueue>,
}

impl SubmissionService {
    pub fn new(
        admission: Arc<AdmissionController>,
        ledger: Arc<CreditLedger>,
        queue: Arc<RenderQueue>,
    ) -> Self {
        Self {
            admission,
            ledger,
            queue,
        }
    }

    /// Accept a render or say why not.
    ///
    /// Credits are consumed before the job is enqueued and refunded if
    /// enqueueing fails, so an accepted job is always paid for. The tier
    /// limits are checked again together with the insert; a submission
    /// that loses that race is refunded and rate limited.
    pub async fn submit(
        &self,
        request: RenderRequest,
        submitter: Submitter,
    ) -> Result<JobHandle, SubmissionError> {
        let job = RenderJob::from_request(request, submitter)?;

        let decision = self
            .admission
            .can_submit(&job.user_id, job.subscription_tier)
            .await?;
        if !decision.allowed {
            return Err(rate_limited(decision));
        }

        let charge = Charge {
            organization_id: &job.organization_id,
            user_id: &job.user_id,
            render_id: &job.id,
        };
        let cost = self.ledger.calculate_cost(&job.settings);
        let consumed = self.ledger.try_consume(charge, &job.settings).await?;
        if let ConsumeOutcome::Insufficient(quota) = consumed {
            return Err(SubmissionError::InsufficientCredits {
                required: cost,
                remaining: quota.remaining,
            });
        }

        let render_id = job.id.clone();
        let organization_id = job.organization_id.clone();
        let user_id = job.user_id.clone();
        let charge = Charge {
            organization_id: &organization_id,
            user_id: &user_id,
            render_id: &render_id,
        };
        match self.queue.submit_admitted(job, cost).await {
            Ok(Enqueued::Queued(handle)) => Ok(handle),
            Ok(Enqueued::RateLimited(decision)) => {
                tracing::info!(
                    job_id = %render_id,
                    user_id = %user_id,
                    "Rate limit reached while enqueueing, refunding",
                );
                self.refund(charge, cost, "Rate limit reached").await;
                Err(rate_limited(decision))
            }
            Err(e) => {
                tracing::error!(
                    job_id = %render_id,
                    error = %e,
                    "Enqueue failed after charging, refunding",
                );
                self.refund(charge, cost, "Enqueue failed").await;
                Err(e.into())
            }
        }
    }

    async fn refund(&self, charge: Charge<'_>, cost: u32, reason: &str) {
        let render_id = charge.render_id;
        if let Err(e) = self.ledger.refund_amount(charge, cost, reason).await {
            tracing::error!(job_id = %render_id, error = %e, "Refund after failed enqueue failed");
        }
    }
}

fn rate_limited(decision: AdmissionDecision) -> SubmissionError {
    SubmissionError::RateLimited(
        decision
            .reason
            .unwrap_or_else(|| "Rate limit exceeded".to_string()),
    )
}
