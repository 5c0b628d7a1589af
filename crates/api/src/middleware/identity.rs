//! Identity extractors.
//!
//! Authentication happens upstream; the gateway forwards the resolved
//! identity in request headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use verdant_core::render::Submitter;
use verdant_core::tier::SubscriptionTier;

use crate::error::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const ORGANIZATION_ID_HEADER: &str = "x-organization-id";
pub const SUBSCRIPTION_TIER_HEADER: &str = "x-subscription-tier";

/// The calling user, their organization and subscription tier.
#[derive(Debug, Clone)]
pub struct Identity(pub Submitter);

impl Identity {
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }

    pub fn organization_id(&self) -> &str {
        &self.0.organization_id
    }

    /// Reject access to another organization's resources.
    pub fn require_organization(&self, organization_id: &str) -> Result<(), AppError> {
        if self.0.organization_id != organization_id {
            return Err(AppError::Forbidden(
                "Resource belongs to another organization".into(),
            ));
        }
        Ok(())
    }
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)?;
        let organization_id = header(parts, ORGANIZATION_ID_HEADER)?;
        let subscription_tier = header(parts, SUBSCRIPTION_TIER_HEADER)?
            .parse::<SubscriptionTier>()
            .map_err(|_| {
                AppError::Unauthorized(format!("Invalid {SUBSCRIPTION_TIER_HEADER} header"))
            })?;

        Ok(Identity(Submitter {
            user_id,
            organization_id,
            subscription_tier,
        }))
    }
}

pub(crate) fn header(parts: &Parts, name: &str) -> Result<String, AppError> {
    optional_header(parts, name)
        .ok_or_else(|| AppError::Unauthorized(format!("Missing {name} header")))
}

pub(crate) fn optional_header(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
