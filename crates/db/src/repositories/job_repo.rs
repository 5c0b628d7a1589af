//! Repository for the `render_jobs` table.

use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use verdant_core::admission::{self, AdmissionDecision};
use verdant_core::job::{JobRecord, RenderOutcome, CANCELLED_ERROR, STALLED_ERROR};
use verdant_core::scheduling::{JobState, RetentionPolicy};
use verdant_core::types::Timestamp;

use crate::models::{to_db_int, JobRow};

/// Column list for `render_jobs` queries.
const COLUMNS: &str = "\
    id, payload, state, priority, attempts_made, max_attempts, cost, \
    submitted_at, run_at, started_at, finished_at, worker_id, lease_expires_at, \
    render_status, quality_status, image_url, thumbnail_url, quality_score, \
    perceptual_hash, error";

pub struct JobRepo;

impl JobRepo {
    pub async fn insert(pool: &PgPool, record: &JobRecord) -> Result<(), sqlx::Error> {
        insert_query(record).execute(pool).await?;
        Ok(())
    }

    /// Insert `record` if its submitter is still inside the tier limits.
    ///
    /// A transaction-scoped advisory lock keyed by user id serializes
    /// concurrent submissions from one user, so the count and the insert
    /// see the same rows.
    pub async fn insert_if_admitted(
        pool: &PgPool,
        record: &JobRecord,
        now: Timestamp,
    ) -> Result<AdmissionDecision, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.job.user_id)
            .execute(&mut *tx)
            .await?;

        let (minute_ago, hour_ago) = admission::window_starts(now);
        let states: Vec<&str> = JobState::IN_FLIGHT.iter().map(|s| s.as_str()).collect();
        let (in_last_minute, in_last_hour) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*) FILTER (WHERE submitted_at >= $3), COUNT(*) \
             FROM render_jobs \
             WHERE user_id = $1 AND state = ANY($2) AND submitted_at >= $4",
        )
        .bind(&record.job.user_id)
        .bind(&states)
        .bind(minute_ago)
        .bind(hour_ago)
        .fetch_one(&mut *tx)
        .await?;

        let decision = admission::evaluate(
            record.job.subscription_tier,
            u64::try_from(in_last_minute).unwrap_or(0),
            u64::try_from(in_last_hour).unwrap_or(0),
        );
        if decision.allowed {
            insert_query(record).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(decision)
    }

    pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM render_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically claim the next ready job.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same row. Lower priority values are served first, then
    /// earlier submissions.
    pub async fn claim_next(
        pool: &PgPool,
        worker_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET state = 'active', attempts_made = attempts_made + 1, started_at = $2, \
                 worker_id = $1, lease_expires_at = $3, render_status = 'processing' \
             WHERE id = ( \
                 SELECT id FROM render_jobs \
                 WHERE state IN ('waiting', 'delayed') AND run_at <= $2 \
                 ORDER BY priority ASC, submitted_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(worker_id)
            .bind(now)
            .bind(lease_until)
            .fetch_optional(pool)
            .await
    }

    /// Finish an active job. Returns `None` if it is not active.
    pub async fn finish(
        pool: &PgPool,
        id: &str,
        state: JobState,
        outcome: &RenderOutcome,
        now: Timestamp,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET state = $2, finished_at = $3, lease_expires_at = NULL, \
                 render_status = $4, quality_status = $5, image_url = $6, thumbnail_url = $7, \
                 quality_score = $8, perceptual_hash = $9, error = $10 \
             WHERE id = $1 AND state = 'active' \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(state.as_str())
            .bind(now)
            .bind(outcome.render_status.as_str())
            .bind(outcome.quality_status.as_str())
            .bind(&outcome.image_url)
            .bind(&outcome.thumbnail_url)
            .bind(outcome.quality_score)
            .bind(outcome.perceptual_hash.as_ref().map(|h| h.as_str()))
            .bind(&outcome.error)
            .fetch_optional(pool)
            .await
    }

    /// Return an active job to the queue as `delayed`.
    pub async fn schedule_retry(
        pool: &PgPool,
        id: &str,
        run_at: Timestamp,
        error: &str,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET state = 'delayed', run_at = $2, error = $3, render_status = 'queued', \
                 worker_id = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND state = 'active' \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(run_at)
            .bind(error)
            .fetch_optional(pool)
            .await
    }

    /// Cancel a job that has not started. Returns `None` otherwise.
    pub async fn cancel(
        pool: &PgPool,
        id: &str,
        now: Timestamp,
    ) -> Result<Option<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET state = 'cancelled', finished_at = $2, render_status = 'failed', error = $3 \
             WHERE id = $1 AND state IN ('waiting', 'delayed') \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .bind(now)
            .bind(CANCELLED_ERROR)
            .fetch_optional(pool)
            .await
    }

    /// Returns `true` if a row was updated.
    pub async fn update_outcome(
        pool: &PgPool,
        id: &str,
        outcome: &RenderOutcome,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE render_jobs \
             SET render_status = $2, quality_status = $3, image_url = $4, thumbnail_url = $5, \
                 quality_score = $6, perceptual_hash = $7, error = $8 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(outcome.render_status.as_str())
        .bind(outcome.quality_status.as_str())
        .bind(&outcome.image_url)
        .bind(&outcome.thumbnail_url)
        .bind(outcome.quality_score)
        .bind(outcome.perceptual_hash.as_ref().map(|h| h.as_str()))
        .bind(&outcome.error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_user_jobs_since(
        pool: &PgPool,
        user_id: &str,
        states: &[JobState],
        since: Timestamp,
    ) -> Result<i64, sqlx::Error> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM render_jobs \
             WHERE user_id = $1 AND state = ANY($2) AND submitted_at >= $3",
        )
        .bind(user_id)
        .bind(&states)
        .bind(since)
        .fetch_one(pool)
        .await
    }

    /// Delete finished jobs older than the policy age or beyond its count.
    pub async fn prune_finished(
        pool: &PgPool,
        state: JobState,
        policy: RetentionPolicy,
        cutoff: Timestamp,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM render_jobs WHERE id IN ( \
                 SELECT id FROM ( \
                     SELECT id, finished_at, \
                            ROW_NUMBER() OVER (ORDER BY finished_at DESC, id DESC) AS rn \
                     FROM render_jobs WHERE state = $1 \
                 ) ranked \
                 WHERE rn > $2 OR finished_at < $3 \
             )",
        )
        .bind(state.as_str())
        .bind(i64::try_from(policy.max_count).unwrap_or(i64::MAX))
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-queue active jobs whose lease expired and that have attempts left.
    pub async fn requeue_stalled(
        pool: &PgPool,
        now: Timestamp,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "UPDATE render_jobs \
             SET state = 'waiting', run_at = $1, worker_id = NULL, lease_expires_at = NULL, \
                 render_status = 'queued' \
             WHERE state = 'active' AND lease_expires_at < $1 AND attempts_made < max_attempts \
             RETURNING id",
        )
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Fail active jobs whose lease expired with no attempts left.
    pub async fn fail_stalled(pool: &PgPool, now: Timestamp) -> Result<Vec<JobRow>, sqlx::Error> {
        let query = format!(
            "UPDATE render_jobs \
             SET state = 'failed', finished_at = $1, worker_id = NULL, lease_expires_at = NULL, \
                 render_status = 'failed', error = $2 \
             WHERE state = 'active' AND lease_expires_at < $1 AND attempts_made >= max_attempts \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(now)
            .bind(STALLED_ERROR)
            .fetch_all(pool)
            .await
    }
}

fn insert_query(record: &JobRecord) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(
        "INSERT INTO render_jobs (\
             id, user_id, organization_id, payload, state, priority, attempts_made, \
             max_attempts, cost, submitted_at, run_at, render_status, quality_status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(&record.job.id)
    .bind(&record.job.user_id)
    .bind(&record.job.organization_id)
    .bind(Json(&record.job))
    .bind(record.state.as_str())
    .bind(record.priority)
    .bind(to_db_int(record.attempts_made))
    .bind(to_db_int(record.max_attempts))
    .bind(to_db_int(record.cost))
    .bind(record.submitted_at)
    .bind(record.run_at)
    .bind(record.outcome.render_status.as_str())
    .bind(record.outcome.quality_status.as_str())
}
