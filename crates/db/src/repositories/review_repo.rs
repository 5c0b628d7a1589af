//! Repository for the `quality_reviews` table.

use sqlx::types::Json;
use sqlx::PgPool;
use verdant_core::review::{QualityReview, ReviewDecision, ReviewStatus};

use crate::models::{HashRow, ReviewRow};

/// Column list for `quality_reviews` queries.
const COLUMNS: &str = "\
    id, render_id, project_id, image_url, thumbnail_url, quality_score, issues, status, \
    reviewed_by, reviewed_at, review_notes, metadata, created_at";

pub struct ReviewRepo;

impl ReviewRepo {
    pub async fn insert(pool: &PgPool, review: &QualityReview) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO quality_reviews (\
                 id, render_id, project_id, image_url, thumbnail_url, quality_score, issues, \
                 status, reviewed_by, reviewed_at, review_notes, metadata, perceptual_hash, \
                 created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&review.id)
        .bind(&review.render_id)
        .bind(&review.project_id)
        .bind(&review.image_url)
        .bind(&review.thumbnail_url)
        .bind(review.quality_score)
        .bind(Json(&review.issues))
        .bind(review.status.as_str())
        .bind(&review.reviewed_by)
        .bind(review.reviewed_at)
        .bind(&review.review_notes)
        .bind(Json(&review.metadata))
        .bind(review.metadata.perceptual_hash.as_ref().map(|h| h.as_str()))
        .bind(review.created_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<ReviewRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM quality_reviews WHERE id = $1");
        sqlx::query_as::<_, ReviewRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_render(
        pool: &PgPool,
        render_id: &str,
    ) -> Result<Option<ReviewRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM quality_reviews WHERE render_id = $1");
        sqlx::query_as::<_, ReviewRow>(&query)
            .bind(render_id)
            .fetch_optional(pool)
            .await
    }

    /// Apply a decision to a review that is still `pending`.
    pub async fn decide(
        pool: &PgPool,
        id: &str,
        decision: &ReviewDecision,
    ) -> Result<Option<ReviewRow>, sqlx::Error> {
        let query = format!(
            "UPDATE quality_reviews \
             SET status = $2, reviewed_by = $3, reviewed_at = $4, review_notes = $5 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ReviewRow>(&query)
            .bind(id)
            .bind(decision.status.as_str())
            .bind(&decision.reviewer)
            .bind(decision.decided_at)
            .bind(&decision.notes)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(
        pool: &PgPool,
        status: Option<ReviewStatus>,
        limit: i64,
    ) -> Result<Vec<ReviewRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM quality_reviews \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $2"
        );
        sqlx::query_as::<_, ReviewRow>(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// The most recent hashed reviews, newest first.
    pub async fn recent_hashes(pool: &PgPool, limit: i64) -> Result<Vec<HashRow>, sqlx::Error> {
        sqlx::query_as::<_, HashRow>(
            "SELECT id, render_id, perceptual_hash FROM quality_reviews \
             WHERE perceptual_hash IS NOT NULL \
             ORDER BY created_at DESC, id DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
