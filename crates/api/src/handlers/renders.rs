//! Handlers for the `/renders` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use verdant_core::error::CoreError;
use verdant_core::job::{JobRecord, QualityStatus, RenderStatus};
use verdant_core::render::{RenderRequest, RenderSettings};
use verdant_core::scheduling::JobState;
use verdant_core::types::{EntityId, Timestamp};

use crate::error::{AppError, AppResult};
use crate::middleware::identity::Identity;
use crate::response::DataResponse;
use crate::state::AppState;

/// A render as the submitting organization sees it.
#[derive(Debug, Serialize)]
pub struct RenderView {
    pub id: EntityId,
    pub project_id: EntityId,
    pub scene_id: EntityId,
    pub state: JobState,
    pub render_status: RenderStatus,
    pub quality_status: QualityStatus,
    pub priority: i32,
    pub attempts_made: u32,
    pub cost: u32,
    pub settings: RenderSettings,
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub quality_score: Option<f64>,
    pub error: Option<String>,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl From<JobRecord> for RenderView {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.job.id,
            project_id: record.job.project_id,
            scene_id: record.job.scene_id,
            state: record.state,
            render_status: record.outcome.render_status,
            quality_status: record.outcome.quality_status,
            priority: record.priority,
            attempts_made: record.attempts_made,
            cost: record.cost,
            settings: record.job.settings,
            image_url: record.outcome.image_url,
            thumbnail_url: record.outcome.thumbnail_url,
            quality_score: record.outcome.quality_score,
            error: record.outcome.error,
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

/// Load a render owned by the caller's organization. Other organizations'
/// renders are reported as missing.
async fn find_owned(state: &AppState, identity: &Identity, id: &str) -> AppResult<JobRecord> {
    let record = state.services.queue.get(id).await?;
    if record.job.organization_id != identity.organization_id() {
        return Err(AppError::Core(CoreError::NotFound {
            entity: "render job",
            id: id.to_string(),
        }));
    }
    Ok(record)
}

/// POST /api/v1/renders
///
/// Returns 201 with the job handle, or 429 / 402 / 400 with the rejection
/// code.
pub async fn submit_render(
    identity: Identity,
    State(state): State<AppState>,
    Json(request): Json<RenderRequest>,
) -> AppResult<impl IntoResponse> {
    let handle = state
        .services
        .submissions
        .submit(request, identity.0.clone())
        .await?;

    tracing::info!(
        job_id = %handle.id,
        user_id = identity.user_id(),
        cost = handle.cost,
        "Render submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: handle })))
}

/// GET /api/v1/renders/{id}
pub async fn get_render(
    identity: Identity,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<RenderView>>> {
    let record = find_owned(&state, &identity, &id).await?;
    Ok(Json(DataResponse { data: record.into() }))
}

/// DELETE /api/v1/renders/{id}
///
/// Cancels a render that has not started; its credits are refunded.
pub async fn cancel_render(
    identity: Identity,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<RenderView>>> {
    find_owned(&state, &identity, &id).await?;
    let record = state.services.queue.cancel(&id).await?;

    tracing::info!(job_id = %id, user_id = identity.user_id(), "Render cancelled by user");
    Ok(Json(DataResponse { data: record.into() }))
}
