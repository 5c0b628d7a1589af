//! Record store interfaces.
//!
//! Both the in-memory store and the PostgreSQL store implement these; the
//! pipeline services only ever see the traits. Operations that must be atomic
//! (claiming a job, consuming credits, refunding, deciding a review) are
//! single trait methods so each backend can make them atomic its own way.

use async_trait::async_trait;

use crate::admission::AdmissionDecision;
use crate::credits::{ConsumeOutcome, CreditTransaction, QuotaStatus};
use crate::job::{JobRecord, RenderOutcome};
use crate::perceptual_hash::PerceptualHash;
use crate::review::{QualityReview, ReviewDecision, ReviewStatus};
use crate::scheduling::{JobState, RetentionPolicy};
use crate::types::{EntityId, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Jobs returned to the pool or given up on by stalled-job recovery.
#[derive(Debug, Clone, Default)]
pub struct StalledRecovery {
    pub requeued: Vec<EntityId>,
    /// Jobs that had no attempts left; they are now `failed`.
    pub failed: Vec<JobRecord>,
}

/// A hashed review considered by the duplicate search.
#[derive(Debug, Clone, PartialEq)]
pub struct HashedReview {
    pub review_id: EntityId,
    pub render_id: EntityId,
    pub perceptual_hash: PerceptualHash,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Count the submitter's in-flight jobs in the admission windows ending
    /// at `now` and insert `record` only if its tier allows another one.
    ///
    /// Counting and inserting are one step per user: concurrent submissions
    /// from the same user are admitted one at a time.
    async fn insert_job_if_admitted(
        &self,
        record: &JobRecord,
        now: Timestamp,
    ) -> Result<AdmissionDecision, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically claim the next ready job in priority-then-FIFO order.
    ///
    /// The claimed job becomes `active`, its attempt counter is incremented,
    /// and its lease runs until `lease_until`.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Move an active job to `completed` or `failed` with its final outcome.
    async fn finish_job(
        &self,
        id: &str,
        state: JobState,
        outcome: &RenderOutcome,
        now: Timestamp,
    ) -> Result<JobRecord, StoreError>;

    /// Put an active job back as `delayed` until `run_at`.
    async fn schedule_retry(
        &self,
        id: &str,
        run_at: Timestamp,
        error: &str,
    ) -> Result<JobRecord, StoreError>;

    /// Cancel a `waiting` or `delayed` job. Returns `None` if the job exists
    /// but has already started or finished.
    async fn cancel_job(&self, id: &str, now: Timestamp) -> Result<Option<JobRecord>, StoreError>;

    /// Replace the render outcome without touching queue state.
    async fn update_outcome(&self, id: &str, outcome: &RenderOutcome) -> Result<(), StoreError>;

    /// Jobs by `user_id` in one of `states` submitted at or after `since`.
    async fn count_user_jobs_since(
        &self,
        user_id: &str,
        states: &[JobState],
        since: Timestamp,
    ) -> Result<u64, StoreError>;

    /// Delete finished jobs in `state` outside the retention policy.
    async fn prune_finished(
        &self,
        state: JobState,
        policy: RetentionPolicy,
        now: Timestamp,
    ) -> Result<u64, StoreError>;

    /// Recover active jobs whose lease expired before `now`.
    async fn recover_stalled(&self, now: Timestamp) -> Result<StalledRecovery, StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current quota, applying a due monthly refresh first.
    ///
    /// Organizations without a provisioned quota report a zero total.
    async fn get_quota(
        &self,
        organization_id: &str,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError>;

    async fn set_quota_total(
        &self,
        organization_id: &str,
        total: u32,
        now: Timestamp,
    ) -> Result<QuotaStatus, StoreError>;

    /// Refresh if due, then check `remaining >= tx.amount` and increment
    /// `used` while recording `tx`, all in one atomic step.
    async fn try_consume(
        &self,
        tx: &CreditTransaction,
        now: Timestamp,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Decrement `used` (floored at zero) and record `tx`, unless a refund
    /// for the same render already exists. Returns whether it was applied.
    async fn refund_once(&self, tx: &CreditTransaction, now: Timestamp) -> Result<bool, StoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, StoreError>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn insert_review(&self, review: &QualityReview) -> Result<(), StoreError>;

    async fn get_review(&self, id: &str) -> Result<Option<QualityReview>, StoreError>;

    async fn find_review_by_render(
        &self,
        render_id: &str,
    ) -> Result<Option<QualityReview>, StoreError>;

    /// Apply a human decision if the review is still `pending`.
    ///
    /// Returns `None` when the review exists but was already decided.
    async fn decide_review(
        &self,
        id: &str,
        decision: &ReviewDecision,
    ) -> Result<Option<QualityReview>, StoreError>;

    /// Newest first, optionally filtered by status.
    async fn list_reviews(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<QualityReview>, StoreError>;

    /// Perceptual hashes of the `limit` most recent hashed reviews.
    async fn recent_hashes(&self, limit: usize) -> Result<Vec<HashedReview>, StoreError>;
}

/// Convenience bound for a backend that stores everything.
pub trait RecordStore: JobStore + LedgerStore + ReviewStore {}

impl<T: JobStore + LedgerStore + ReviewStore> RecordStore for T {}
