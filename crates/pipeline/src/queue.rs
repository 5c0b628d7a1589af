//! Durable priority queue of render jobs.
//!
//! Jobs are served lowest priority value first, FIFO among equals. A failed
//! attempt is retried with exponential backoff while the failure is
//! transient and attempts remain; every permanent failure refunds the
//! credits consumed at submission.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use verdant_core::admission::AdmissionDecision;
use verdant_core::job::{JobRecord, RenderOutcome, RenderStatus, CANCELLED_ERROR};
use verdant_core::render::RenderJob;
use verdant_core::scheduling::{
    JobState, RetentionPolicy, RetryDecision, RetryPolicy, DEFAULT_LEASE,
};
use verdant_core::store::JobStore;
use verdant_core::types::{EntityId, Timestamp};
use verdant_events::bus::{RENDER_CANCELLED, RENDER_COMPLETED, RENDER_FAILED, RENDER_QUEUED};
use verdant_events::{EventBus, PipelineEvent};

use crate::error::{PipelineError, RenderFailure};
use crate::ledger::{Charge, CreditLedger};

/// What the submitter gets back for an accepted render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub id: EntityId,
    pub priority: i32,
    pub state: JobState,
    pub cost: u32,
}

/// Result of an admission-checked enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued(JobHandle),
    /// The submitter reached a tier limit; nothing was stored.
    RateLimited(AdmissionDecision),
}

/// How a finished attempt was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed,
    RetryScheduled { delay: Duration },
    Failed { refunded: bool },
}

/// Jobs removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct RenderQueue {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<CreditLedger>,
    events: Arc<EventBus>,
    retry: RetryPolicy,
    lease: Duration,
}

impl RenderQueue {
    pub fn new(jobs: Arc<dyn JobStore>, ledger: Arc<CreditLedger>, events: Arc<EventBus>) -> Self {
        Self {
            jobs,
            ledger,
            events,
            retry: RetryPolicy::default(),
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long a claimed job may run before it counts as stalled.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Enqueue a render whose credits are already consumed.
    pub async fn submit(&self, job: RenderJob, cost: u32) -> Result<JobHandle, PipelineError> {
        let record = self.new_record(job, cost);
        self.jobs.insert_job(&record).await?;
        Ok(self.queued(&record))
    }

    /// Enqueue a paid render if its submitter is still within the tier
    /// limits. The limit check and the insert are one store operation.
    pub async fn submit_admitted(
        &self,
        job: RenderJob,
        cost: u32,
    ) -> Result<Enqueued, PipelineError> {
        let record = self.new_record(job, cost);
        let decision = self
            .jobs
            .insert_job_if_admitted(&record, record.submitted_at)
            .await?;
        if !decision.allowed {
            return Ok(Enqueued::RateLimited(decision));
        }
        Ok(Enqueued::Queued(self.queued(&record)))
    }

    pub async fn get(&self, id: &str) -> Result<JobRecord, PipelineError> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or_else(|| PipelineError::not_found("render job", id))
    }

    /// Cancel a job that has not started yet and refund its credits.
    pub async fn cancel(&self, id: &str) -> Result<JobRecord, PipelineError> {
        let Some(record) = self.jobs.cancel_job(id, Utc::now()).await? else {
            let current = self.get(id).await?;
            return Err(PipelineError::conflict(format!(
                "Render {id} is '{}' and can no longer be cancelled",
                current.state
            )));
        };

        self.ledger
            .refund_amount(charge(&record), record.cost, CANCELLED_ERROR)
            .await?;

        tracing::info!(job_id = id, "Render cancelled");
        self.events.publish(
            PipelineEvent::new(RENDER_CANCELLED)
                .with_subject(id)
                .with_organization(record.job.organization_id.clone())
                .with_actor(record.job.user_id.clone()),
        );
        Ok(record)
    }

    /// Claim the next ready job for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<JobRecord>, PipelineError> {
        let now = Utc::now();
        let lease_until = now + chrono::Duration::from_std(self.lease).unwrap_or_default();
        let claimed = self.jobs.claim_next(worker_id, now, lease_until).await?;
        if let Some(record) = &claimed {
            tracing::debug!(
                job_id = %record.id(),
                worker_id,
                attempt = record.attempts_made,
                "Render claimed",
            );
        }
        Ok(claimed)
    }

    /// Record the result of an attempt on a claimed job.
    pub async fn settle(
        &self,
        record: &JobRecord,
        result: Result<RenderOutcome, RenderFailure>,
    ) -> Result<Settlement, PipelineError> {
        let now = Utc::now();
        match result {
            Ok(mut outcome) => {
                outcome.render_status = RenderStatus::Completed;
                outcome.error = None;
                self.jobs
                    .finish_job(record.id(), JobState::Completed, &outcome, now)
                    .await?;

                tracing::info!(
                    job_id = %record.id(),
                    attempt = record.attempts_made,
                    quality_score = outcome.quality_score,
                    "Render completed",
                );
                self.events.publish(
                    PipelineEvent::new(RENDER_COMPLETED)
                        .with_subject(record.id().clone())
                        .with_organization(record.job.organization_id.clone())
                        .with_payload(serde_json::json!({
                            "image_url": outcome.image_url,
                            "quality_score": outcome.quality_score,
                            "quality_status": outcome.quality_status,
                        })),
                );
                Ok(Settlement::Completed)
            }
            Err(failure) => match self.retry.decide(failure.kind, record.attempts_made) {
                RetryDecision::Retry { delay } => {
                    let run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                    self.jobs
                        .schedule_retry(record.id(), run_at, &failure.message)
                        .await?;
                    tracing::warn!(
                        job_id = %record.id(),
                        attempt = record.attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Render attempt failed, retry scheduled",
                    );
                    Ok(Settlement::RetryScheduled { delay })
                }
                RetryDecision::GiveUp => self.fail(record, failure, now).await,
            },
        }
    }

    /// Return stalled jobs to the queue, refunding the ones that ran out of
    /// attempts.
    pub async fn recover_stalled(&self) -> Result<usize, PipelineError> {
        let recovery = self.jobs.recover_stalled(Utc::now()).await?;
        for id in &recovery.requeued {
            tracing::warn!(job_id = %id, "Stalled render requeued");
        }
        for record in &recovery.failed {
            tracing::error!(job_id = %record.id(), "Stalled render failed after final attempt");
            self.ledger
                .refund_amount(charge(record), record.cost, "Render stalled")
                .await?;
            self.publish_failed(record, "stalled");
        }
        Ok(recovery.requeued.len() + recovery.failed.len())
    }

    /// Apply the retention policies to finished jobs.
    pub async fn prune(&self, now: Timestamp) -> Result<PruneReport, PipelineError> {
        let report = PruneReport {
            completed: self
                .jobs
                .prune_finished(JobState::Completed, RetentionPolicy::COMPLETED, now)
                .await?,
            failed: self
                .jobs
                .prune_finished(JobState::Failed, RetentionPolicy::FAILED, now)
                .await?,
            cancelled: self
                .jobs
                .prune_finished(JobState::Cancelled, RetentionPolicy::FAILED, now)
                .await?,
        };
        if report != PruneReport::default() {
            tracing::info!(
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "Pruned finished renders",
            );
        }
        Ok(report)
    }

    // ---- private helpers ----

    fn new_record(&self, job: RenderJob, cost: u32) -> JobRecord {
        JobRecord::new(job, cost, Utc::now()).with_max_attempts(self.retry.max_attempts)
    }

    fn queued(&self, record: &JobRecord) -> JobHandle {
        tracing::info!(
            job_id = %record.id(),
            organization_id = %record.job.organization_id,
            priority = record.priority,
            cost = record.cost,
            "Render queued",
        );
        self.events.publish(
            PipelineEvent::new(RENDER_QUEUED)
                .with_subject(record.id().clone())
                .with_organization(record.job.organization_id.clone())
                .with_payload(serde_json::json!({
                    "priority": record.priority,
                    "cost": record.cost,
                })),
        );
        JobHandle {
            id: record.id().clone(),
            priority: record.priority,
            state: record.state,
            cost: record.cost,
        }
    }

    async fn fail(
        &self,
        record: &JobRecord,
        failure: RenderFailure,
        now: Timestamp,
    ) -> Result<Settlement, PipelineError> {
        let mut outcome = failure.outcome.unwrap_or_else(|| record.outcome.clone());
        outcome.render_status = RenderStatus::Failed;
        outcome.error = Some(failure.message.clone());
        let finished = self
            .jobs
            .finish_job(record.id(), JobState::Failed, &outcome, now)
            .await?;

        tracing::error!(
            job_id = %record.id(),
            attempt = record.attempts_made,
            kind = %failure.kind,
            error = %failure.message,
            "Render failed",
        );

        let refunded = self
            .ledger
            .refund_amount(charge(record), record.cost, &failure.message)
            .await?;
        self.publish_failed(&finished, failure.kind.as_str());
        Ok(Settlement::Failed { refunded })
    }

    fn publish_failed(&self, record: &JobRecord, kind: &str) {
        self.events.publish(
            PipelineEvent::new(RENDER_FAILED)
                .with_subject(record.id().clone())
                .with_organization(record.job.organization_id.clone())
                .with_payload(serde_json::json!({
                    "kind": kind,
                    "error": record.outcome.error,
                    "attempts": record.attempts_made,
                })),
        );
    }
}

fn charge(record: &JobRecord) -> Charge<'_> {
    Charge {
        organization_id: &record.job.organization_id,
        user_id: &record.job.user_id,
        render_id: &record.job.id,
    }
}
