//! PostgreSQL implementation of the record store traits.

use async_trait::async_trait;
use chrono::Duration;
use verdant_core::admission::AdmissionDecision;
use verdant_core::credits::{ConsumeOutcome, CreditTransaction, QuotaStatus};
use verdant_core::job::{JobRecord, RenderOutcome};
use verdant_core::review::{QualityReview, ReviewDecision, ReviewStatus};
use verdant_core::scheduling::{JobState, RetentionPolicy};
use verdant_core::store::{
    HashedReview, JobStore, LedgerStore, ReviewStore, StalledRecovery, StoreError,
};
use verdant_core::types::Timestamp;

use crate::models::JobRow;
use crate::repositories::{ConsumeRow, JobRepo, LedgerRepo, ReviewRepo};
use crate::DbPool;

/// Map a sqlx error onto the store taxonomy.
pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound {
            entity: "row",
            id: String::new(),
        },
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
            "duplicate key violates {}",
            db.constraint().unwrap_or("unique constraint")
        )),
        other => StoreError::Backend(other.to_string()),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Distinguish "missing" from "in the wrong state" after a guarded update.
    async fn job_state_conflict(&self, id: &str, wanted: &str) -> StoreError {
        match JobRepo::find_by_id(&self.pool, id).await {
            Ok(Some(row)) => StoreError::Conflict(format!(
                "Render job {id} is '{}', expected {wanted}",
                row.state
            )),
            Ok(None) => StoreError::NotFound {
                entity: "render job",
                id: id.to_string(),
            },
            Err(e) => map_sqlx_error(e),
        }
    }
}

fn to_record(row: JobRow) -> Result<JobRecord, StoreError> {
    JobRecord::try_from(row)
}

fn unprovisioned(organization_id: &str, now: Timestamp) -> QuotaStatus {
    QuotaStatus::new(organization_id, 0, 0, verdant_core::credits::next_refresh_date(now))
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        JobRepo::insert(&self.pool, record).await.map_err(map_sqlx_error)
    }

    async fn insert_job_if_admitted(
        &self,
        record: &JobRecord,
        now: Timestamp,
    ) -> Result<AdmissionDecision, StoreError> {
        JobRepo::insert_if_admitted(&self.pool, record, now)
            .await
            .map_err(map_sqlx_error)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        JobRepo::find_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(to_record)
            .transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<JobRecord>, StoreError> {
        JobRepo::claim_next(&self.pool, worker_id, now, lease_until)
            .await
            .map_err(map_sqlx_error)?
            .map(to_record)
            .transpose()
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
        match JobRepo::finish(&self.pool, id, state, outcome, now)
            .await
            .map_err(map_sqlx_error)?
        {
            Some(row) => to_record(row),
            None => Err(self.job_state_conflict(id, "'active'").await),
        }
    }

    async fn schedule_retry(
        &self,
        id: &str,
        run_at: Timestamp,
        error: &str,
    ) -> Result<JobRecord, StoreError> {
        match JobRepo::schedule_retry(&self.pool, id, run_at, error)
            .await
            .map_err(map_sqlx_error)?
        {
            Some(row) => to_record(row),
            None => Err(self.job_state_conflict(id, "'active'").await),
        }
    }

    async fn cancel_job(&self, id: &str, now: Timestamp) -> Result<Option<JobRecord>, StoreError> {
        if let Some(row) = JobRepo::cancel(&self.pool, id, now)
            .await
            .map_err(map_sqlx_error)?
        {
            return to_record(row).map(Some);
        }
        match JobRepo::find_by_id(&self.pool, id).await.map_err(map_sqlx_error)? {
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound {
                entity: "render job",
                id: id.to_string(),
            }),
        }
    }

    async fn update_outcome(&self, id: &str, outcome: &RenderOutcome) -> Result<(), StoreError> {
        let updated = JobRepo::update_outcome(&self.pool, id, outcome)
            .await
            .map_err(map_sqlx_error)?;
        if updated {
            Ok(())
        } else {
            Err(StoreError::NotFound {
                entity: "render job",
                id: id.to_string(),
            })
        }
    }

    async fn count_user_jobs_since(
        &self,
        user_id: &str,
        states: &[JobState],
        since: Timestamp,
    ) -> Result<u64, StoreError> {
        let count = JobRepo::count_user_jobs_since(&self.pool, user_id, states, since)
            .await
            .map_err(map_sqlx_error)?;
        Ok(u64::try_from(count).unwrap_or(0))
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
        JobRepo::prune_finished(&self.pool, state, policy, cutoff)
            .await
            .map_err(map_sqlx_error)
    }

    async fn recover_stalled(&self, now: Timestamp) -> Result<StalledRecovery, StoreError> {
        let requeued = JobRepo::requeue_stalled(&self.pool, now)
            .await
            .map_err(map_sqlx_error)?;
        let failed = JobRepo::fail_stalled(&self.pool, now)
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(to_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StalledRecovery { requeued, failed })
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_quota(
        &self,
        organization_id: &str,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError> {
        let row = LedgerRepo::get_quota(&self.pool, organization_id, now)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(QuotaStatus::from).unwrap_or_else(|| unprovisioned(organization_id, now)))
    }

    async fn set_quota_total(
        &self,
        organization_id: &str,
        total: u32,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError> {
        LedgerRepo::upsert_total(&self.pool, organization_id, total, now)
            .await
            .map(QuotaStatus::from)
            .map_err(map_sqlx_error)
    }

    async fn try_consume(
        &self,
        tx: &CreditTransaction,
        now: Timestamp,
    ) -> Result<ConsumeOutcome, StoreError> {
        let outcome = LedgerRepo::consume(&self.pool, tx, now)
            .await
            .map_err(map_sqlx_error)?;
        Ok(match outcome {
            ConsumeRow::Consumed(row) => ConsumeOutcome::Consumed(row.into()),
            ConsumeRow::Insufficient(row) => ConsumeOutcome::Insufficient(
                row.map(QuotaStatus::from)
                    .unwrap_or_else(|| unprovisioned(&tx.organization_id, now)),
            ),
        })
    }

    async fn refund_once(
        &self,
        tx: &CreditTransaction,
        now: Timestamp,
    ) -> Result<bool, StoreError> {
        LedgerRepo::refund_once(&self.pool, tx, now)
            .await
            .map_err(map_sqlx_error)
    }

    async fn list_transactions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        LedgerRepo::list_transactions(&self.pool, organization_id, limit_param(limit))
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(CreditTransaction::try_from)
            .collect()
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn insert_review(&self, review: &QualityReview) -> Result<(), StoreError> {
        ReviewRepo::insert(&self.pool, review).await.map_err(map_sqlx_error)
    }

    async fn get_review(&self, id: &str) -> Result<Option<QualityReview>, StoreError> {
        ReviewRepo::find_by_id(&self.pool, id)
            .await
            .map_err(map_sqlx_error)?
            .map(QualityReview::try_from)
            .transpose()
    }

    async fn find_review_by_render(
        &self,
        render_id: &str,
    ) -> Result<Option<QualityReview>, StoreError> {
        ReviewRepo::find_by_render(&self.pool, render_id)
            .await
            .map_err(map_sqlx_error)?
            .map(QualityReview::try_from)
            .transpose()
    }

    async fn decide_review(
        &self,
        id: &str,
        decision: &ReviewDecision,
    ) -> Result<Option<QualityReview>, StoreError> {
        if let Some(row) = ReviewRepo::decide(&self.pool, id, decision)
            .await
            .map_err(map_sqlx_error)?
        {
            return QualityReview::try_from(row).map(Some);
        }
        match ReviewRepo::find_by_id(&self.pool, id).await.map_err(map_sqlx_error)? {
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound {
                entity: "quality review",
                id: id.to_string(),
            }),
        }
    }

    async fn list_reviews(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<QualityReview>, StoreError> {
        ReviewRepo::list(&self.pool, status, limit_param(limit))
            .await
            .map_err(map_sqlx_error)?
            .into_iter()
            .map(QualityReview::try_from)
            .collect()
    }

    async fn recent_hashes(&self, limit: usize) -> Result<Vec<HashedReview>, StoreError> {
        let rows = ReviewRepo::recent_hashes(&self.pool, limit_param(limit))
            .await
            .map_err(map_sqlx_error)?;
        let mut hashes = Vec::with_capacity(rows.len());
        for row in rows {
            // Malformed hashes are skipped.
            match row.perceptual_hash.parse() {
                Ok(perceptual_hash) => hashes.push(HashedReview {
                    review_id: row.id,
                    render_id: row.render_id,
                    perceptual_hash,
                }),
                Err(e) => tracing::warn!(
                    review_id = %row.id,
                    error = %e,
                    "Skipping malformed perceptual hash",
                ),
            }
        }
        Ok(hashes)
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
