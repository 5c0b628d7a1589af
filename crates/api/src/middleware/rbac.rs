//! Role extractors for operator routes.
//!
//! The gateway forwards the caller's role in the `x-role` header. Callers
//! without one are ordinary organization members.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::identity::{header, optional_header, USER_ID_HEADER};
use crate::error::AppError;
use crate::state::AppState;

pub const ROLE_HEADER: &str = "x-role";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_REVIEWER: &str = "reviewer";

/// Requires the `admin` role. Rejects with 403 Forbidden otherwise.
/// Holds the admin's user id.
pub struct RequireAdmin(pub String);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)?;
        if optional_header(parts, ROLE_HEADER).as_deref() != Some(ROLE_ADMIN) {
            return Err(AppError::Forbidden("Admin role required".into()));
        }
        Ok(RequireAdmin(user_id))
    }
}

/// Requires `reviewer` or `admin` role. Rejects with 403 Forbidden
/// otherwise. Reviewers act across organizations.
pub struct RequireReviewer(pub String);

impl FromRequestParts<AppState> for RequireReviewer {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)?;
        match optional_header(parts, ROLE_HEADER).as_deref() {
            Some(ROLE_REVIEWER) | Some(ROLE_ADMIN) => Ok(RequireReviewer(user_id)),
            _ => Err(AppError::Forbidden(
                "Reviewer or Admin role required".into(),
            )),
        }
    }
}
