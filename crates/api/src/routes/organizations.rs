use axum::routing::get;
use axum::Router;

use crate::handlers::organizations;
use crate::state::AppState;

/// Routes mounted at `/organizations`. Members may only read their own
/// organization; provisioning requires the admin role.
///
/// ```text
/// GET    /{id}/quota         -> get_quota
/// PUT    /{id}/quota         -> set_quota (admin)
/// GET    /{id}/transactions  -> list_transactions
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/{id}/quota",
            get(organizations::get_quota).put(organizations::set_quota),
        )
        .route("/{id}/transactions", get(organizations::list_transactions))
}
