//! Render worker pool.
//!
//! Polls the queue every `poll_interval`, claiming jobs while permits are
//! free, and runs each claimed job on its own task. A second ticker
//! recovers stalled jobs and prunes finished ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use verdant_core::job::JobRecord;
use verdant_pipeline::PipelineServices;

pub struct WorkerPool {
    services: PipelineServices,
    worker_id: String,
    concurrency: usize,
    poll_interval: Duration,
    maintenance_interval: Duration,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        services: PipelineServices,
        worker_id: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            services,
            worker_id: worker_id.into(),
            concurrency,
            poll_interval: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(60),
            permits: Arc::new(Semaphore::new(concurrency)),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Run until `cancel` fires, then wait for in-flight jobs to settle.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        tracing::info!(
            worker_id = %self.worker_id,
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker pool started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(worker_id = %self.worker_id, "Worker pool shutting down");
                    break;
                }
                _ = poll.tick() => {
                    self.fill().await;
                }
                _ = maintenance.tick() => {
                    self.maintain().await;
                }
            }
        }

        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(worker_id = %self.worker_id, "Worker pool stopped");
    }

    /// Claim jobs until the queue is empty or every permit is taken.
    /// Returns how many jobs were started.
    pub async fn fill(&self) -> usize {
        let mut started = 0;
        while let Ok(permit) = self.permits.clone().try_acquire_owned() {
            match self.services.queue.claim_next(&self.worker_id).await {
                Ok(Some(record)) => {
                    self.spawn(record, permit);
                    started += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed");
                    break;
                }
            }
        }
        started
    }

    /// Recover stalled jobs and apply retention.
    pub async fn maintain(&self) {
        match self.services.queue.recover_stalled().await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(recovered, "Recovered stalled renders"),
            Err(e) => tracing::error!(error = %e, "Stalled render recovery failed"),
        }
        if let Err(e) = self.services.queue.prune(Utc::now()).await {
            tracing::error!(error = %e, "Render retention pass failed");
        }
    }

    /// Wait for every spawned job to settle without stopping the pool.
    pub async fn idle(&self) {
        // Holding every permit means nothing is in flight.
        let all = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(all).await {
            drop(permits);
        }
    }

    fn spawn(&self, record: JobRecord, permit: OwnedSemaphorePermit) {
        let services = self.services.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            let job_id = record.id().clone();
            let result = services.processor.process(&record).await;
            if let Err(e) = services.queue.settle(&record, result).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record render result");
            }
        });
    }
}
