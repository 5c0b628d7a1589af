//! Shared setup for API integration tests: in-memory store, a generator
//! that always returns the same image, and request helpers that carry
//! identity headers.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use tower::ServiceExt;
use verdant_core::render::{
    GeneratorProvider, OutputFormat, Prompt, RenderRequest, RenderSettings, Resolution,
};
use verdant_db::MemoryStore;
use verdant_events::EventBus;
use verdant_pipeline::generator::{
    GeneratedImage, GenerationError, GenerationRequest, ImageFetcher, ImageGenerator,
};
use verdant_pipeline::{
    Collaborators, GeneratorRegistry, LocalBlobStore, PipelineServices, ServiceSettings,
};

use verdant_api::config::ServerConfig;
use verdant_api::router::build_app_router;
use verdant_api::state::AppState;

pub const ORG: &str = "org-1";
pub const USER: &str = "alice";
pub const REVIEWER: &str = "rita";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: 30,
        database_max_connections: 1,
        embedded_worker_concurrency: 1,
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// 600x600 gradient that passes every quality check.
pub fn good_png() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(600, 600, |x, y| {
        Rgb([
            (x * 255 / 599) as u8,
            (y * 255 / 599) as u8,
            ((x + y) * 255 / 1198) as u8,
        ])
    }))
    .write_to(&mut buf, ImageFormat::Png)
    .unwrap();
    buf.into_inner()
}

struct FixedGenerator(Vec<u8>);

#[async_trait]
impl ImageGenerator for FixedGenerator {
    async fn generate(&self, _: &GenerationRequest) -> Result<GeneratedImage, GenerationError> {
        Ok(GeneratedImage::from_bytes(self.0.clone()))
    }
}

struct NoFetch;

#[async_trait]
impl ImageFetcher for NoFetch {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        Err(GenerationError::Validation(format!("unexpected fetch of {url}")))
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub services: PipelineServices,
    _blobs: tempfile::TempDir,
}

/// Full router over an in-memory store. No worker runs; tests drive
/// processing through [`TestApp::process_next`].
pub fn build_test_app() -> TestApp {
    let blobs = tempfile::tempdir().unwrap();
    let collaborators = Collaborators {
        generators: GeneratorRegistry::new()
            .with(GeneratorProvider::OpenAi, Arc::new(FixedGenerator(good_png()))),
        fetcher: Arc::new(NoFetch),
        blobs: Arc::new(LocalBlobStore::new(blobs.path(), "https://blobs.test")),
    };
    let services = PipelineServices::new(
        Arc::new(MemoryStore::new()),
        Arc::new(EventBus::default()),
        collaborators,
        ServiceSettings::default(),
    );

    let config = test_config();
    let state = AppState {
        services: services.clone(),
        config: Arc::new(config.clone()),
        pool: None,
    };

    TestApp {
        router: build_app_router(state, &config),
        services,
        _blobs: blobs,
    }
}

impl TestApp {
    pub async fn provision(&self, total: u32) {
        self.services.ledger.set_quota_total(ORG, total).await.unwrap();
    }

    /// Claim and run one render the way a worker would.
    pub async fn process_next(&self) {
        let record = self
            .services
            .queue
            .claim_next("test-worker")
            .await
            .unwrap()
            .expect("a queued render");
        let result = self.services.processor.process(&record).await;
        self.services.queue.settle(&record, result).await.unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Request as `alice` of `org-1` on the pro tier.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        self.send(authed(method, uri, body, USER, ORG)).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.call(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.call(Method::POST, uri, Some(body)).await
    }

    /// Request as `rita`, a reviewer outside `org-1`.
    pub async fn call_as_reviewer(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response<Body> {
        let request = authed(method, uri, body, REVIEWER, "operators");
        self.send(with_role(request, "reviewer")).await
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn authed(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
    user: &str,
    org: &str,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", user)
        .header("x-organization-id", org)
        .header("x-subscription-tier", "pro");
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn with_role(mut request: Request<Body>, role: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert("x-role", role.parse().unwrap());
    request
}

pub fn render_body(width: u32, height: u32, quality: u8) -> serde_json::Value {
    serde_json::to_value(RenderRequest {
        project_id: "proj-1".to_string(),
        scene_id: "scene-1".to_string(),
        source_image_url: "https://cdn.test/backyard.jpg".to_string(),
        mask_image_url: None,
        prompt: Prompt {
            system: String::new(),
            user: "Add a flagstone patio".to_string(),
        },
        annotations: vec![],
        settings: RenderSettings {
            provider: GeneratorProvider::OpenAi,
            resolution: Resolution::new(width, height),
            format: OutputFormat::Png,
            quality,
        },
    })
    .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
