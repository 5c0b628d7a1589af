pub mod health;
pub mod organizations;
pub mod renders;
pub mod reviews;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /renders                                 submit (POST)
/// /renders/{id}                            get, cancel (GET, DELETE)
///
/// /organizations/{id}/quota                get, provision (GET, PUT)
/// /organizations/{id}/transactions         credit history (GET)
///
/// /reviews                                 list (GET, ?status=&limit=)
/// /reviews/{id}                            get
/// /reviews/{id}/approve                    approve (POST)
/// /reviews/{id}/reject                     reject (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/renders", renders::router())
        .nest("/organizations", organizations::router())
        .nest("/reviews", reviews::router())
}
