use axum::routing::{get, post};
use axum::Router;

use crate::handlers::reviews;
use crate::state::AppState;

/// Routes mounted at `/reviews`. Reviewer or admin role only.
///
/// ```text
/// GET    /                -> list_reviews
/// GET    /{id}            -> get_review
/// POST   /{id}/approve    -> approve_review
/// POST   /{id}/reject     -> reject_review
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(reviews::list_reviews))
        .route("/{id}", get(reviews::get_review))
        .route("/{id}/approve", post(reviews::approve_review))
        .route("/{id}/reject", post(reviews::reject_review))
}
