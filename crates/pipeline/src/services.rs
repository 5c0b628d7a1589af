//! Wiring of the pipeline services over one record store.

use std::sync::Arc;

use verdant_core::quality::QualityThresholds;
use verdant_core::scheduling::{RetryPolicy, DEFAULT_LEASE};
use verdant_core::store::RecordStore;
use verdant_events::EventBus;

use crate::admission::AdmissionController;
use crate::blob::BlobStore;
use crate::config::PipelineConfig;
use crate::generator::{
    GenerationError, GeneratorRegistry, HttpImageFetcher, HttpImageGenerator, ImageFetcher,
    DEFAULT_FETCH_TIMEOUT,
};
use crate::ledger::CreditLedger;
use crate::processor::RenderProcessor;
use crate::queue::RenderQueue;
use crate::review_queue::{DuplicatePolicy, ReviewQueue};
use crate::submission::SubmissionService;

/// Collaborators the pipeline does not own.
pub struct Collaborators {
    pub generators: GeneratorRegistry,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Tunables shared by the services.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub retry: RetryPolicy,
    pub lease: std::time::Duration,
    pub thresholds: QualityThresholds,
    pub duplicates: DuplicatePolicy,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease: DEFAULT_LEASE,
            thresholds: QualityThresholds::default(),
            duplicates: DuplicatePolicy::default(),
        }
    }
}

impl From<&PipelineConfig> for ServiceSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            lease: config.lease,
            thresholds: config.thresholds.clone(),
            duplicates: config.duplicates.clone(),
        }
    }
}

/// Every pipeline service, sharing one store and one event bus.
#[derive(Clone)]
pub struct PipelineServices {
    pub events: Arc<EventBus>,
    pub admission: Arc<AdmissionController>,
    pub ledger: Arc<CreditLedger>,
    pub queue: Arc<RenderQueue>,
    pub reviews: Arc<ReviewQueue>,
    pub submissions: Arc<SubmissionService>,
    pub processor: Arc<RenderProcessor>,
}

impl PipelineServices {
    pub fn new<S: RecordStore + 'static>(
        store: Arc<S>,
        events: Arc<EventBus>,
        collaborators: Collaborators,
        settings: ServiceSettings,
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(store.clone()));
        let ledger = Arc::new(CreditLedger::new(store.clone(), events.clone()));
        let queue = Arc::new(
            RenderQueue::new(store.clone(), ledger.clone(), events.clone())
                .with_retry_policy(settings.retry)
                .with_lease(settings.lease),
        );
        let reviews = Arc::new(ReviewQueue::new(
            store.clone(),
            store,
            events.clone(),
            settings.duplicates,
        ));
        let submissions = Arc::new(SubmissionService::new(
            admission.clone(),
            ledger.clone(),
            queue.clone(),
        ));
        let processor = Arc::new(RenderProcessor::new(
            collaborators.generators,
            collaborators.fetcher,
            collaborators.blobs,
            reviews.clone(),
            settings.thresholds,
        ));

        Self {
            events,
            admission,
            ledger,
            queue,
            reviews,
            submissions,
            processor,
        }
    }
}

/// HTTP generators for every configured provider plus an HTTP fetcher.
pub fn http_collaborators(
    config: &PipelineConfig,
    blobs: Arc<dyn BlobStore>,
) -> Result<Collaborators, GenerationError> {
    let mut generators = GeneratorRegistry::new();
    for endpoint in &config.generators {
        let generator = HttpImageGenerator::new(
            endpoint.url.clone(),
            endpoint.api_key.clone(),
            config.generation_timeout,
        )?;
        generators.register(endpoint.provider, Arc::new(generator));
        tracing::info!(
            provider = endpoint.provider.as_str(),
            url = %endpoint.url,
            "Image generator registered",
        );
    }
    if generators.is_empty() {
        tracing::warn!("No image generators configured; every render will fail validation");
    }

    Ok(Collaborators {
        generators,
        fetcher: Arc::new(HttpImageFetcher::new(DEFAULT_FETCH_TIMEOUT)?),
        blobs,
    })
}
