use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verdant_core::store::RecordStore;
use verdant_db::{DbPool, MemoryStore, PgStore};
use verdant_events::{EventBus, EventLogger};
use verdant_pipeline::services::http_collaborators;
use verdant_pipeline::{LocalBlobStore, PipelineConfig, PipelineServices, ServiceSettings};
use verdant_worker::WorkerPool;

use verdant_api::config::ServerConfig;
use verdant_api::router::build_app_router;
use verdant_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "verdant_api=debug,verdant_pipeline=debug,verdant_worker=debug,tower_http=debug".into()
    });
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    let pipeline = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Store ---
    match pipeline.database_url.clone() {
        Some(url) => {
            let pool = verdant_db::create_pool(&url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            verdant_db::health_check(&pool)
                .await
                .context("Database health check failed")?;
            verdant_db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database connected, migrations applied");

            let store = Arc::new(PgStore::new(pool.clone()));
            serve(store, Some(pool), config, pipeline).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store with an embedded worker");
            serve(Arc::new(MemoryStore::new()), None, config, pipeline).await
        }
    }
}

async fn serve<S: RecordStore + 'static>(
    store: Arc<S>,
    pool: Option<DbPool>,
    config: ServerConfig,
    pipeline: PipelineConfig,
) -> anyhow::Result<()> {
    // --- Event bus ---
    let events = Arc::new(EventBus::default());
    let logger_handle = tokio::spawn(EventLogger::run(events.subscribe()));

    // --- Pipeline services ---
    let blobs = Arc::new(LocalBlobStore::new(
        pipeline.blob_root.clone(),
        pipeline.blob_public_url.clone(),
    ));
    let collaborators =
        http_collaborators(&pipeline, blobs).context("Failed to build image generators")?;
    let services = PipelineServices::new(
        store,
        Arc::clone(&events),
        collaborators,
        ServiceSettings::from(&pipeline),
    );

    // --- Embedded worker ---
    // With the database store, renders are processed by separate worker
    // processes. The in-memory store is private to this process.
    let worker_cancel = CancellationToken::new();
    let worker_handle = if pool.is_none() {
        let worker = WorkerPool::new(
            services.clone(),
            "api-embedded",
            config.embedded_worker_concurrency,
        );
        let cancel = worker_cancel.clone();
        Some(tokio::spawn(async move { worker.run(cancel).await }))
    } else {
        None
    };

    // --- Router ---
    let state = AppState {
        services,
        config: Arc::new(config.clone()),
        pool,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("Invalid HOST address '{}'", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    worker_cancel.cancel();
    if let Some(handle) = worker_handle {
        let _ = tokio::time::timeout(Duration::from_secs(30), handle).await;
        tracing::info!("Embedded worker stopped");
    }

    // Dropping the last sender closes the channel and ends the logger.
    drop(events);
    let _ = tokio::time::timeout(Duration::from_secs(5), logger_handle).await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
