//! Route definitions for the `/renders` resource.
//!
//! All endpoints require identity headers.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::renders;
use crate::state::AppState;

/// Routes mounted at `/renders`.
///
/// ```text
/// POST   /                -> submit_render
/// GET    /{id}            -> get_render
/// DELETE /{id}            -> cancel_render
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(renders::submit_render))
        .route(
            "/{id}",
            get(renders::get_render).delete(renders::cancel_render),
        )
}
