//! Render request model and submission validation.
//!
//! A [`RenderJob`] is the immutable description of one render request. It is
//! built from a [`RenderRequest`] (what the client sent) plus a resolved
//! [`Submitter`] (who sent it), validated once, and never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::tier::SubscriptionTier;
use crate::types::{new_id, EntityId};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Smallest accepted output edge, in pixels.
pub const MIN_OUTPUT_EDGE: u32 = 64;

/// Largest accepted output edge, in pixels.
pub const MAX_OUTPUT_EDGE: u32 = 8192;

/// Maximum length of the user prompt.
pub const MAX_PROMPT_LENGTH: usize = 4_000;

/// Maximum number of annotations attached to one render.
pub const MAX_ANNOTATIONS: usize = 200;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Output dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Image generation backend requested for the render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorProvider {
    GoogleImagen,
    OpenAi,
}

impl GeneratorProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleImagen => "google_imagen",
            Self::OpenAi => "open_ai",
        }
    }
}

/// Encoded output format requested from the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// Generation settings attached to a render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    pub provider: GeneratorProvider,
    pub resolution: Resolution,
    pub format: OutputFormat,
    /// Requested quality, 1..=100.
    pub quality: u8,
}

// ---------------------------------------------------------------------------
// Prompt and annotations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Mask,
    AssetInstance,
    TextLabel,
}

/// A canvas annotation. The pipeline carries `data` through untouched; only
/// the prompt builder behind the image generator interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Render request body as received from the submission surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub project_id: EntityId,
    pub scene_id: EntityId,
    pub source_image_url: String,
    #[serde(default)]
    pub mask_image_url: Option<String>,
    pub prompt: Prompt,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    pub settings: RenderSettings,
}

/// Identity of the submitter, resolved by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub user_id: EntityId,
    pub organization_id: EntityId,
    pub subscription_tier: SubscriptionTier,
}

/// Immutable description of one render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: EntityId,
    pub project_id: EntityId,
    pub scene_id: EntityId,
    pub user_id: EntityId,
    pub organization_id: EntityId,
    pub subscription_tier: SubscriptionTier,
    pub source_image_url: String,
    pub mask_image_url: Option<String>,
    pub prompt: Prompt,
    pub annotations: Vec<Annotation>,
    pub settings: RenderSettings,
}

impl RenderJob {
    /// Validate `request` and build a job with a fresh id.
    pub fn from_request(request: RenderRequest, submitter: Submitter) -> Result<Self, CoreError> {
        validate_request(&request)?;
        validate_id("user_id", &submitter.user_id)?;
        validate_id("organization_id", &submitter.organization_id)?;

        Ok(Self {
            id: new_id(),
            project_id: request.project_id,
            scene_id: request.scene_id,
            user_id: submitter.user_id,
            organization_id: submitter.organization_id,
            subscription_tier: submitter.subscription_tier,
            source_image_url: request.source_image_url,
            mask_image_url: request.mask_image_url,
            prompt: request.prompt,
            annotations: request.annotations,
            settings: request.settings,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a submission before any credits are touched.
pub fn validate_request(request: &RenderRequest) -> Result<(), CoreError> {
    validate_id("project_id", &request.project_id)?;
    validate_id("scene_id", &request.scene_id)?;
    validate_url("source_image_url", &request.source_image_url)?;
    if let Some(mask) = &request.mask_image_url {
        validate_url("mask_image_url", mask)?;
    }

    if request.prompt.user.trim().is_empty() {
        return Err(CoreError::Validation(
            "Prompt must not be empty".to_string(),
        ));
    }
    if request.prompt.user.len() > MAX_PROMPT_LENGTH {
        return Err(CoreError::Validation(format!(
            "Prompt exceeds maximum length of {MAX_PROMPT_LENGTH} characters"
        )));
    }
    if request.annotations.len() > MAX_ANNOTATIONS {
        return Err(CoreError::Validation(format!(
            "A render may carry at most {MAX_ANNOTATIONS} annotations"
        )));
    }

    validate_settings(&request.settings)
}

/// Validate resolution bounds and quality range.
pub fn validate_settings(settings: &RenderSettings) -> Result<(), CoreError> {
    let Resolution { width, height } = settings.resolution;
    for (name, edge) in [("width", width), ("height", height)] {
        if !(MIN_OUTPUT_EDGE..=MAX_OUTPUT_EDGE).contains(&edge) {
            return Err(CoreError::Validation(format!(
                "Resolution {name} must be between {MIN_OUTPUT_EDGE} and {MAX_OUTPUT_EDGE}, got {edge}"
            )));
        }
    }
    if !(1..=100).contains(&settings.quality) {
        return Err(CoreError::Validation(format!(
            "Quality must be between 1 and 100, got {}",
            settings.quality
        )));
    }
    Ok(())
}

fn validate_id(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<(), CoreError> {
    if !(value.starts_with("https://") || value.starts_with("http://")) {
        return Err(CoreError::Validation(format!(
            "{field} must be an http(s) URL"
        )));
    }
    Ok(())
}
