//! Shared harness for pipeline integration tests: in-memory store, scripted
//! generator, filesystem blob store in a temp dir.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use verdant_core::job::JobRecord;
use verdant_core::render::{
    GeneratorProvider, OutputFormat, Prompt, RenderRequest, RenderSettings, Resolution, Submitter,
};
use verdant_core::scheduling::RetryPolicy;
use verdant_core::tier::SubscriptionTier;
use verdant_db::MemoryStore;
use verdant_events::EventBus;
use verdant_pipeline::generator::{
    GeneratedImage, GenerationError, GenerationRequest, ImageFetcher, ImageGenerator,
};
use verdant_pipeline::{
    Collaborators, GeneratorRegistry, LocalBlobStore, PipelineServices, ServiceSettings, Settlement,
};

pub const ORG: &str = "org-1";

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

fn encode(image: ImageBuffer<Rgb<u8>, Vec<u8>>) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// 600x600 gradient: passes every check with a score of 1.0.
pub fn good_png() -> Vec<u8> {
    encode(ImageBuffer::from_fn(600, 600, |x, y| {
        Rgb([
            (x * 255 / 599) as u8,
            (y * 255 / 599) as u8,
            ((x + y) * 255 / 1198) as u8,
        ])
    }))
}

/// 600x600 near-flat image: very low contrast and entropy, score 0.5.
pub fn flat_png() -> Vec<u8> {
    encode(ImageBuffer::from_fn(600, 600, |x, y| {
        let v = 100 + ((x + y) % 8) as u8;
        Rgb([v, v, v])
    }))
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Returns scripted results in order, then `fallback` forever.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GeneratedImage, GenerationError>>>,
    fallback: Vec<u8>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(fallback: Vec<u8>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, result: Result<GeneratedImage, GenerationError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, GenerationError> {
        self.calls.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(GeneratedImage::from_bytes(self.fallback.clone())),
        }
    }
}

/// Serves the same bytes for every URL.
pub struct StaticFetcher(pub Vec<u8>);

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, GenerationError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub services: PipelineServices,
    pub generator: Arc<ScriptedGenerator>,
    pub blob_dir: tempfile::TempDir,
}

impl Harness {
    /// Pipeline whose generator returns `image` unless scripted otherwise.
    /// Retries are scheduled without delay.
    pub async fn new(image: Vec<u8>, quota: u32) -> Self {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(ScriptedGenerator::new(image.clone()));
        let blob_dir = tempfile::tempdir().unwrap();

        let collaborators = Collaborators {
            generators: GeneratorRegistry::new()
                .with(GeneratorProvider::OpenAi, generator.clone())
                .with(GeneratorProvider::GoogleImagen, generator.clone()),
            fetcher: Arc::new(StaticFetcher(image)),
            blobs: Arc::new(LocalBlobStore::new(blob_dir.path(), "https://blobs.test")),
        };
        let settings = ServiceSettings {
            retry: RetryPolicy {
                initial_delay: Duration::ZERO,
                ..RetryPolicy::default()
            },
            ..ServiceSettings::default()
        };
        let services = PipelineServices::new(
            store.clone(),
            Arc::new(EventBus::default()),
            collaborators,
            settings,
        );
        services.ledger.set_quota_total(ORG, quota).await.unwrap();

        Self {
            store,
            services,
            generator,
            blob_dir,
        }
    }

    /// Claim one job and run it to settlement, as a worker would.
    pub async fn run_next(&self) -> Option<(JobRecord, Settlement)> {
        let record = self.services.queue.claim_next("test-worker").await.unwrap()?;
        let result = self.services.processor.process(&record).await;
        let settlement = self.services.queue.settle(&record, result).await.unwrap();
        Some((record, settlement))
    }

    pub async fn used(&self) -> u32 {
        self.services.ledger.check_quota(ORG).await.unwrap().used
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn request(width: u32, height: u32, quality: u8) -> RenderRequest {
    RenderRequest {
        project_id: "proj-1".to_string(),
        scene_id: "scene-1".to_string(),
        source_image_url: "https://cdn.test/backyard.jpg".to_string(),
        mask_image_url: None,
        prompt: Prompt {
            system: "You are a landscape designer.".to_string(),
            user: "Add a flagstone patio".to_string(),
        },
        annotations: vec![],
        settings: RenderSettings {
            provider: GeneratorProvider::OpenAi,
            resolution: Resolution::new(width, height),
            format: OutputFormat::Png,
            quality,
        },
    }
}

pub fn submitter(user: &str, tier: SubscriptionTier) -> Submitter {
    Submitter {
        user_id: user.to_string(),
        organization_id: ORG.to_string(),
        subscription_tier: tier,
    }
}
