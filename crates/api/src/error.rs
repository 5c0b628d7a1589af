use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use verdant_core::error::CoreError;
use verdant_core::store::StoreError;
use verdant_pipeline::{PipelineError, SubmissionError};

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce `{ "error", "code" }` JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// Identity headers missing or malformed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The caller's organization does not own the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Core(e) => Self::Core(e),
            PipelineError::Store(e) => Self::Store(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Core(core) => classify_core(core),
            AppError::Store(store) => classify_store(store),
            AppError::Submission(err) => {
                let code = err.code();
                match err {
                    SubmissionError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, code, msg),
                    e @ SubmissionError::InsufficientCredits { .. } => {
                        (StatusCode::PAYMENT_REQUIRED, code, e.to_string())
                    }
                    SubmissionError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, code, msg),
                    SubmissionError::Pipeline(PipelineError::Core(e)) => classify_core(e),
                    SubmissionError::Pipeline(PipelineError::Store(e)) => classify_store(e),
                }
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core(err: CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal error");
            internal()
        }
    }
}

fn classify_store(err: StoreError) -> (StatusCode, &'static str, String) {
    match err {
        StoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{entity} with id {id} not found"),
        ),
        StoreError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
        StoreError::Backend(msg) => {
            tracing::error!(error = %msg, "Store error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "An internal error occurred".to_string(),
    )
}
