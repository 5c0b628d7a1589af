//! Handlers for organization credit quotas.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use verdant_core::credits::{CreditTransaction, QuotaStatus};

use crate::error::AppResult;
use crate::middleware::identity::Identity;
use crate::middleware::rbac::RequireAdmin;
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_TRANSACTION_LIMIT: usize = 50;
const MAX_TRANSACTION_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SetQuota {
    pub total: u32,
}

/// GET /api/v1/organizations/{id}/quota
pub async fn get_quota(
    identity: Identity,
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
) -> AppResult<Json<DataResponse<QuotaStatus>>> {
    identity.require_organization(&organization_id)?;
    let quota = state.services.ledger.check_quota(&organization_id).await?;
    Ok(Json(DataResponse { data: quota }))
}

/// PUT /api/v1/organizations/{id}/quota
///
/// Provision the monthly credit total. Admin only; credits already used
/// this period stay used.
pub async fn set_quota(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    Json(input): Json<SetQuota>,
) -> AppResult<Json<DataResponse<QuotaStatus>>> {
    let quota = state
        .services
        .ledger
        .set_quota_total(&organization_id, input.total)
        .await?;
    tracing::info!(
        organization_id = %organization_id,
        total = input.total,
        admin = %admin,
        "Quota provisioned",
    );
    Ok(Json(DataResponse { data: quota }))
}

/// GET /api/v1/organizations/{id}/transactions
///
/// Newest first; `limit` defaults to 50 and is capped at 500.
pub async fn list_transactions(
    identity: Identity,
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    Query(query): Query<TransactionQuery>,
) -> AppResult<Json<DataResponse<Vec<CreditTransaction>>>> {
    identity.require_organization(&organization_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
        .min(MAX_TRANSACTION_LIMIT);
    let transactions = state
        .services
        .ledger
        .transactions(&organization_id, limit)
        .await?;
    Ok(Json(DataResponse { data: transactions }))
}
