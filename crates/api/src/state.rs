use std::sync::Arc;

use verdant_pipeline::PipelineServices;

use crate::config::ServerConfig;

/// Shared application state available to all handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub services: PipelineServices,
    pub config: Arc<ServerConfig>,
    /// PostgreSQL pool when running on the database store; used by the
    /// health check.
    pub pool: Option<verdant_db::DbPool>,
}
