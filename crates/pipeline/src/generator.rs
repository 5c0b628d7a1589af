//! Image generator collaborators.
//!
//! A generator takes the prompt, annotations and settings of a job and
//! returns either the image bytes or a URL to fetch them from. The
//! reference adapter speaks JSON over HTTP using [`reqwest`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use verdant_core::render::{Annotation, GeneratorProvider, Prompt, RenderJob, RenderSettings};

/// Default timeout for a single generation call.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for downloading a generated image.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub render_id: String,
    pub source_image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_image_url: Option<String>,
    pub prompt: Prompt,
    pub annotations: Vec<Annotation>,
    pub settings: RenderSettings,
}

impl GenerationRequest {
    pub fn from_job(job: &RenderJob) -> Self {
        Self {
            render_id: job.id.clone(),
            source_image_url: job.source_image_url.clone(),
            mask_image_url: job.mask_image_url.clone(),
            prompt: job.prompt.clone(),
            annotations: job.annotations.clone(),
            settings: job.settings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub data: ImageData,
    /// Provider-specific details (model, seed, latency, ...).
    pub metadata: serde_json::Value,
}

impl GeneratedImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: ImageData::Bytes(bytes),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            data: ImageData::Url(url.into()),
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// Timeouts, connection failures, 5xx and 429. Worth retrying.
    #[error("Generator temporarily unavailable: {0}")]
    Transient(String),

    /// The provider refused the request. Retrying will not help.
    #[error("Generator rejected the request: {0}")]
    Validation(String),
}

impl GenerationError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {body}");
        match status {
            408 | 429 | 500..=599 => Self::Transient(message),
            _ => Self::Validation(message),
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        if err.is_decode() || err.is_builder() {
            Self::Validation(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, GenerationError>;
}

/// Downloads images that a generator returned by URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, GenerationError>;
}

// ---------------------------------------------------------------------------
// HTTP adapters
// ---------------------------------------------------------------------------

/// JSON response body when the provider does not stream the image back.
#[derive(Debug, Deserialize)]
struct UrlResponse {
    image_url: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

/// Generator that POSTs the request as JSON to a provider endpoint.
///
/// An `image/*` response body is taken as the image itself; anything else
/// must be a JSON object carrying `image_url`.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpImageGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Validation(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, endpoint, api_key))
    }

    /// Reuse an existing client so providers share one connection pool.
    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedImage, GenerationError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = ensure_success(builder.send().await?).await?;

        let is_image = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("image/"));

        if is_image {
            let bytes = response.bytes().await?;
            return Ok(GeneratedImage::from_bytes(bytes.to_vec()));
        }

        let body: UrlResponse = response.json().await?;
        Ok(GeneratedImage {
            data: ImageData::Url(body.image_url),
            metadata: body.metadata,
        })
    }
}

pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Validation(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, GenerationError> {
        let response = ensure_success(self.client.get(url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Map a non-2xx response to a classified error, keeping the body for
/// diagnostics.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(GenerationError::from_status(status.as_u16(), &body))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Generators keyed by provider.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<GeneratorProvider, Arc<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: GeneratorProvider, generator: Arc<dyn ImageGenerator>) -> Self {
        self.generators.insert(provider, generator);
        self
    }

    pub fn register(&mut self, provider: GeneratorProvider, generator: Arc<dyn ImageGenerator>) {
        self.generators.insert(provider, generator);
    }

    pub fn get(&self, provider: GeneratorProvider) -> Option<&Arc<dyn ImageGenerator>> {
        self.generators.get(&provider)
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}
