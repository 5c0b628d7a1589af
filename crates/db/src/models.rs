//! Row types for the pipeline tables and their conversions to domain records.

use sqlx::types::Json;
use sqlx::FromRow;
use verdant_core::credits::{CreditTransaction, QuotaStatus, TransactionKind};
use verdant_core::job::{JobRecord, RenderOutcome};
use verdant_core::perceptual_hash::PerceptualHash;
use verdant_core::quality::QualityMetadata;
use verdant_core::render::RenderJob;
use verdant_core::review::QualityReview;
use verdant_core::store::StoreError;
use verdant_core::types::Timestamp;

/// A row from `render_jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub payload: Json<RenderJob>,
    pub state: String,
    pub priority: i32,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub cost: i32,
    pub submitted_at: Timestamp,
    pub run_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub render_status: String,
    pub quality_status: String,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub quality_score: Option<f64>,
    pub perceptual_hash: Option<String>,
    pub error: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let perceptual_hash = row
            .perceptual_hash
            .map(|h| h.parse::<PerceptualHash>())
            .transpose()
            .map_err(|e| corrupt("render_jobs", &row.id, e))?;

        Ok(Self {
            state: row.state.parse().map_err(|e| corrupt("render_jobs", &row.id, e))?,
            priority: row.priority,
            attempts_made: non_negative(row.attempts_made),
            max_attempts: non_negative(row.max_attempts),
            cost: non_negative(row.cost),
            submitted_at: row.submitted_at,
            run_at: row.run_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            worker_id: row.worker_id,
            lease_expires_at: row.lease_expires_at,
            outcome: RenderOutcome {
                render_status: row
                    .render_status
                    .parse()
                    .map_err(|e| corrupt("render_jobs", &row.id, e))?,
                quality_status: row
                    .quality_status
                    .parse()
                    .map_err(|e| corrupt("render_jobs", &row.id, e))?,
                image_url: row.image_url,
                thumbnail_url: row.thumbnail_url,
                quality_score: row.quality_score,
                perceptual_hash,
                error: row.error,
            },
            job: row.payload.0,
        })
    }
}

/// A row from `organization_quotas`.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaRow {
    pub organization_id: String,
    pub total: i32,
    pub used: i32,
    pub refresh_date: Timestamp,
}

impl From<QuotaRow> for QuotaStatus {
    fn from(row: QuotaRow) -> Self {
        QuotaStatus::new(
            row.organization_id,
            non_negative(row.total),
            non_negative(row.used),
            row.refresh_date,
        )
    }
}

/// A row from `credit_transactions`.
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub render_id: String,
    pub amount: i32,
    pub kind: String,
    pub description: String,
    pub created_at: Timestamp,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "consume" => TransactionKind::Consume,
            "refund" => TransactionKind::Refund,
            other => {
                return Err(corrupt(
                    "credit_transactions",
                    &row.id,
                    format!("unknown kind `{other}`"),
                ))
            }
        };
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            user_id: row.user_id,
            render_id: row.render_id,
            amount: non_negative(row.amount),
            kind,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

/// A row from `quality_reviews`.
#[derive(Debug, Clone, FromRow)]
pub struct ReviewRow {
    pub id: String,
    pub render_id: String,
    pub project_id: String,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub quality_score: f64,
    pub issues: Json<Vec<String>>,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<Timestamp>,
    pub review_notes: Option<String>,
    pub metadata: Json<QualityMetadata>,
    pub created_at: Timestamp,
}

impl TryFrom<ReviewRow> for QualityReview {
    type Error = StoreError;

    fn try_from(row: ReviewRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row
                .status
                .parse()
                .map_err(|e| corrupt("quality_reviews", &row.id, e))?,
            id: row.id,
            render_id: row.render_id,
            project_id: row.project_id,
            image_url: row.image_url,
            thumbnail_url: row.thumbnail_url,
            quality_score: row.quality_score,
            issues: row.issues.0,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            review_notes: row.review_notes,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

/// A row from the duplicate-search window query.
#[derive(Debug, Clone, FromRow)]
pub struct HashRow {
    pub id: String,
    pub render_id: String,
    pub perceptual_hash: String,
}

/// Clamp to zero and widen; counters are never negative in the schema.
pub fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Narrow a counter for binding; pipeline counters stay far below `i32::MAX`.
pub fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn corrupt(table: &str, id: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("corrupt row in {table} ({id}): {err}"))
}
