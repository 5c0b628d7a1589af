//! In-process record store for single-node runs and tests.
//!
//! Every operation takes one lock over all tables, which makes each trait
//! method atomic in the same sense as the PostgreSQL transactions.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;
use verdant_core::admission::{self, AdmissionDecision};
use verdant_core::credits::{
    next_refresh_date, ConsumeOutcome, CreditTransaction, QuotaStatus, TransactionKind,
};
use verdant_core::job::{
    dispatch_order, JobRecord, RenderOutcome, RenderStatus, CANCELLED_ERROR, STALLED_ERROR,
};
use verdant_core::review::{QualityReview, ReviewDecision, ReviewStatus};
use verdant_core::scheduling::{JobState, RetentionPolicy};
use verdant_core::store::{
    HashedReview, JobStore, LedgerStore, ReviewStore, StalledRecovery, StoreError,
};
use verdant_core::types::Timestamp;

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, JobRecord>,
    quotas: HashMap<String, QuotaStatus>,
    /// Append-only, oldest first.
    transactions: Vec<CreditTransaction>,
    /// Oldest first.
    reviews: Vec<QualityReview>,
}

impl Tables {
    fn job_mut(&mut self, id: &str) -> Result<&mut JobRecord, StoreError> {
        self.jobs.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "render job",
            id: id.to_string(),
        })
    }

    fn refreshed_quota(
        &mut self,
        organization_id: &str,
        now: Timestamp,
    ) -> Option<&mut QuotaStatus> {
        let quota = self.quotas.get_mut(organization_id)?;
        quota.refresh_if_due(now);
        Some(quota)
    }

    fn count_user_jobs(&self, user_id: &str, states: &[JobState], since: Timestamp) -> u64 {
        let count = self
            .jobs
            .values()
            .filter(|r| {
                r.job.user_id == user_id && states.contains(&r.state) && r.submitted_at >= since
            })
            .count();
        count as u64
    }

    fn insert_new(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        if self.jobs.contains_key(&record.job.id) {
            return Err(StoreError::Conflict(format!(
                "Render job {} already exists",
                record.job.id
            )));
        }
        self.jobs.insert(record.job.id.clone(), record.clone());
        Ok(())
    }

    fn has_transaction(&self, render_id: &str, kind: TransactionKind) -> bool {
        self.transactions
            .iter()
            .any(|t| t.render_id == render_id && t.kind == kind)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unprovisioned(organization_id: &str, now: Timestamp) -> QuotaStatus {
    QuotaStatus::new(organization_id, 0, 0, next_refresh_date(now))
}

fn expect_active(record: &JobRecord) -> Result<(), StoreError> {
    if record.state == JobState::Active {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "Render job {} is '{}', expected 'active'",
            record.job.id, record.state
        )))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.tables.lock().await.insert_new(record)
    }

    async fn insert_job_if_admitted(
        &self,
        record: &JobRecord,
        now: Timestamp,
    ) -> Result<AdmissionDecision, StoreError> {
        let mut tables = self.tables.lock().await;
        let (minute_ago, hour_ago) = admission::window_starts(now);
        let user_id = &record.job.user_id;
        let decision = admission::evaluate(
            record.job.subscription_tier,
            tables.count_user_jobs(user_id, &JobState::IN_FLIGHT, minute_ago),
            tables.count_user_jobs(user_id, &JobState::IN_FLIGHT, hour_ago),
        );
        if decision.allowed {
            tables.insert_new(record)?;
        }
        Ok(decision)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.tables.lock().await.jobs.get(id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut tables = self.tables.lock().await;
        let next_id = tables
            .jobs
            .values()
            .filter(|r| r.is_ready(now))
            .min_by(|a, b| dispatch_order(a, b))
            .map(|r| r.job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let record = tables.job_mut(&id)?;
        record.state = JobState::Active;
        record.attempts_made += 1;
        record.started_at = Some(now);
        record.worker_id = Some(worker_id.to_string());
        record.lease_expires_at = Some(lease_until);
        record.outcome.render_status = RenderStatus::Processing;
        Ok(Some(record.clone()))
    }

    async fn finish_job(
        &self,
        id: &str,
        state: JobState,
        outcome: &RenderOutcome,
        now: Timestamp,
    ) -> Result<JobRecord, StoreError> {
        JobState::Active
            .validate_transition(state)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut tables = self.tables.lock().await;
        let record = tables.job_mut(id)?;
        expect_active(record)?;
        record.state = state;
        record.finished_at = Some(now);
        record.lease_expires_at = None;
        record.outcome = outcome.clone();
        Ok(record.clone())
    }

    async fn schedule_retry(
        &self,
        id: &str,
        run_at: Timestamp,
        error: &str,
    ) -> Result<JobRecord, StoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.job_mut(id)?;
        expect_active(record)?;
        record.state = JobState::Delayed;
        record.run_at = run_at;
        record.worker_id = None;
        record.lease_expires_at = None;
        record.outcome.render_status = RenderStatus::Queued;
        record.outcome.error = Some(error.to_string());
        Ok(record.clone())
    }

    async fn cancel_job(&self, id: &str, now: Timestamp) -> Result<Option<JobRecord>, StoreError> {
        let mut tables = self.tables.lock().await;
        let record = tables.job_mut(id)?;
        if !record.state.is_cancellable() {
            return Ok(None);
        }
        record.state = JobState::Cancelled;
        record.finished_at = Some(now);
        record.outcome.render_status = RenderStatus::Failed;
        record.outcome.error = Some(CANCELLED_ERROR.to_string());
        Ok(Some(record.clone()))
    }

    async fn update_outcome(&self, id: &str, outcome: &RenderOutcome) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.job_mut(id)?.outcome = outcome.clone();
        Ok(())
    }

    async fn count_user_jobs_since(
        &self,
        user_id: &str,
        states: &[JobState],
        since: Timestamp,
    ) -> Result<u64, StoreError> {
        Ok(self.tables.lock().await.count_user_jobs(user_id, states, since))
    }

    async fn prune_finished(
        &self,
        state: JobState,
        policy: RetentionPolicy,
        now: Timestamp,
    ) -> Result<u64, StoreError> {
        if !state.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "Only finished jobs can be pruned, got '{state}'"
            )));
        }
        let max_age = Duration::from_std(policy.max_age).unwrap_or(Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(Timestamp::MIN_UTC);

        let mut tables = self.tables.lock().await;
        let mut finished: Vec<(Timestamp, String)> = tables
            .jobs
            .values()
            .filter(|r| r.state == state)
            .map(|r| (r.finished_at.unwrap_or(r.submitted_at), r.job.id.clone()))
            .collect();
        // Newest first, matching the ranking in the SQL store.
        finished.sort_by(|a, b| b.cmp(a));

        let doomed: Vec<String> = finished
            .into_iter()
            .enumerate()
            .filter(|(rank, (finished_at, _))| *rank >= policy.max_count || *finished_at < cutoff)
            .map(|(_, (_, id))| id)
            .collect();
        for id in &doomed {
            tables.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn recover_stalled(&self, now: Timestamp) -> Result<StalledRecovery, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut recovery = StalledRecovery::default();

        for record in tables.jobs.values_mut() {
            let expired = record.state == JobState::Active
                && record.lease_expires_at.is_some_and(|lease| lease < now);
            if !expired {
                continue;
            }
            record.worker_id = None;
            record.lease_expires_at = None;
            if record.attempts_made < record.max_attempts {
                record.state = JobState::Waiting;
                record.run_at = now;
                record.outcome.render_status = RenderStatus::Queued;
                recovery.requeued.push(record.job.id.clone());
            } else {
                record.state = JobState::Failed;
                record.finished_at = Some(now);
                record.outcome.render_status = RenderStatus::Failed;
                record.outcome.error = Some(STALLED_ERROR.to_string());
                recovery.failed.push(record.clone());
            }
        }
        Ok(recovery)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_quota(
        &self,
        organization_id: &str,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .refreshed_quota(organization_id, now)
            .map(|q| q.clone())
            .unwrap_or_else(|| unprovisioned(organization_id, now)))
    }

    async fn set_quota_total(
        &self,
        organization_id: &str,
        total: u32,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError> {
        let mut tables = self.tables.lock().await;
        let quota = tables
            .quotas
            .entry(organization_id.to_string())
            .or_insert_with(|| QuotaStatus::new(organization_id, total, 0, next_refresh_date(now)));
        quota.total = total;
        quota.remaining = total.saturating_sub(quota.used);
        Ok(quota.clone())
    }

    async fn try_consume(
        &self,
        tx: &CreditTransaction,
        now: Timestamp,
    ) -> Result<ConsumeOutcome, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.has_transaction(&tx.render_id, TransactionKind::Consume) {
            return Err(StoreError::Conflict(format!(
                "Render {} already has a consume transaction",
                tx.render_id
            )));
        }

        let Some(quota) = tables.refreshed_quota(&tx.organization_id, now) else {
            return Ok(ConsumeOutcome::Insufficient(unprovisioned(&tx.organization_id, now)));
        };
        if quota.remaining < tx.amount {
            return Ok(ConsumeOutcome::Insufficient(quota.clone()));
        }
        quota.used += tx.amount;
        quota.remaining = quota.total.saturating_sub(quota.used);
        let snapshot = quota.clone();

        tables.transactions.push(tx.clone());
        Ok(ConsumeOutcome::Consumed(snapshot))
    }

    async fn refund_once(
        &self,
        tx: &CreditTransaction,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.has_transaction(&tx.render_id, TransactionKind::Refund) {
            return Ok(false);
        }
        if let Some(quota) = tables.refreshed_quota(&tx.organization_id, now) {
            quota.used = quota.used.saturating_sub(tx.amount);
            quota.remaining = quota.total.saturating_sub(quota.used);
        }
        tables.transactions.push(tx.clone());
        Ok(true)
    }

    async fn list_transactions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|t| t.organization_id == organization_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn insert_review(&self, review: &QualityReview) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.reviews.iter().any(|r| r.render_id == review.render_id) {
            return Err(StoreError::Conflict(format!(
                "Render {} already has a review",
                review.render_id
            )));
        }
        tables.reviews.push(review.clone());
        Ok(())
    }

    async fn get_review(&self, id: &str) -> Result<Option<QualityReview>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.reviews.iter().find(|r| r.id == id).cloned())
    }

    async fn find_review_by_render(
        &self,
        render_id: &str,
    ) -> Result<Option<QualityReview>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.reviews.iter().find(|r| r.render_id == render_id).cloned())
    }

    async fn decide_review(
        &self,
        id: &str,
        decision: &ReviewDecision,
    ) -> Result<Option<QualityReview>, StoreError> {
        let mut tables = self.tables.lock().await;
        let review = tables
            .reviews
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "quality review",
                id: id.to_string(),
            })?;
        if review.status != ReviewStatus::Pending {
            return Ok(None);
        }
        review
            .apply(decision)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        Ok(Some(review.clone()))
    }

    async fn list_reviews(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<QualityReview>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reviews
            .iter()
            .rev()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_hashes(&self, limit: usize) -> Result<Vec<HashedReview>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reviews
            .iter()
            .rev()
            .filter_map(|r| {
                r.metadata.perceptual_hash.clone().map(|perceptual_hash| HashedReview {
                    review_id: r.id.clone(),
                    render_id: r.render_id.clone(),
                    perceptual_hash,
                })
            })
            .take(limit)
            .collect())
    }
}
