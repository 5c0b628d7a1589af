//! Handlers for the manual quality review queue. Every route requires the
//! reviewer role.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use verdant_core::review::{QualityReview, ReviewStatus};

use crate::error::AppResult;
use crate::middleware::rbac::RequireReviewer;
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ReviewListQuery {
    pub status: Option<ReviewStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveReview {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectReview {
    pub notes: String,
}

/// GET /api/v1/reviews?status=pending&limit=50
pub async fn list_reviews(
    _reviewer: RequireReviewer,
    State(state): State<AppState>,
    Query(query): Query<ReviewListQuery>,
) -> AppResult<Json<DataResponse<Vec<QualityReview>>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let reviews = state.services.reviews.list(query.status, limit).await?;
    Ok(Json(DataResponse { data: reviews }))
}

/// GET /api/v1/reviews/{id}
pub async fn get_review(
    _reviewer: RequireReviewer,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<QualityReview>>> {
    let review = state.services.reviews.get(&id).await?;
    Ok(Json(DataResponse { data: review }))
}

/// POST /api/v1/reviews/{id}/approve
pub async fn approve_review(
    RequireReviewer(reviewer): RequireReviewer,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ApproveReview>,
) -> AppResult<Json<DataResponse<QualityReview>>> {
    let review = state
        .services
        .reviews
        .approve_review(&id, &reviewer, input.notes)
        .await?;
    Ok(Json(DataResponse { data: review }))
}

/// POST /api/v1/reviews/{id}/reject
///
/// Notes are required and become the render's error message.
pub async fn reject_review(
    RequireReviewer(reviewer): RequireReviewer,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RejectReview>,
) -> AppResult<Json<DataResponse<QualityReview>>> {
    let review = state
        .services
        .reviews
        .reject_review(&id, &reviewer, &input.notes)
        .await?;
    Ok(Json(DataResponse { data: review }))
}
