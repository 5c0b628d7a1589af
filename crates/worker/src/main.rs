use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use verdant_core::store::RecordStore;
use verdant_db::{MemoryStore, PgStore};
use verdant_events::{EventBus, EventLogger};
use verdant_pipeline::services::http_collaborators;
use verdant_pipeline::{LocalBlobStore, PipelineServices, ServiceSettings};
use verdant_worker::{WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    match config.pipeline.database_url.clone() {
        Some(url) => {
            let pool = verdant_db::create_pool(&url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            verdant_db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Database connected, migrations applied");
            run(Arc::new(PgStore::new(pool)), config).await
        }
        None => {
            tracing::warn!(
                "DATABASE_URL not set, using in-memory store; jobs are not shared with the API"
            );
            run(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn run<S: RecordStore + 'static>(store: Arc<S>, config: WorkerConfig) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::default());
    tokio::spawn(EventLogger::run(events.subscribe()));

    let blobs = Arc::new(LocalBlobStore::new(
        config.pipeline.blob_root.clone(),
        config.pipeline.blob_public_url.clone(),
    ));
    let collaborators =
        http_collaborators(&config.pipeline, blobs).context("Failed to build image generators")?;
    let services = PipelineServices::new(
        store,
        events,
        collaborators,
        ServiceSettings::from(&config.pipeline),
    );

    let pool = WorkerPool::new(services, config.worker_id.clone(), config.concurrency)
        .with_poll_interval(config.poll_interval)
        .with_maintenance_interval(config.maintenance_interval);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    pool.run(cancel).await;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "verdant_worker=debug,verdant_pipeline=debug".into());

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
}
