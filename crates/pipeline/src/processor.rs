//! One render attempt: generate, check, deduplicate, store, review.

use std::sync::Arc;

use verdant_core::job::{JobRecord, QualityStatus, RenderOutcome, RenderStatus};
use verdant_core::quality::{check_quality, QualityResult, QualityThresholds};
use verdant_core::review::{requires_manual_review, ReviewStatus};
use verdant_core::scheduling::FailureKind;

use crate::blob::{make_thumbnail, BlobStore};
use crate::error::RenderFailure;
use crate::generator::{GenerationRequest, GeneratorRegistry, ImageData, ImageFetcher};
use crate::review_queue::{ReviewEntry, ReviewQueue};

/// Blob path of the full-size render.
pub fn image_path(render_id: &str, extension: &str) -> String {
    format!("renders/{render_id}.{extension}")
}

/// Blob path of the render's thumbnail.
pub fn thumbnail_path(render_id: &str) -> String {
    format!("renders/{render_id}_thumb.png")
}

pub struct RenderProcessor {
    generators: GeneratorRegistry,
    fetcher: Arc<dyn ImageFetcher>,
    blobs: Arc<dyn BlobStore>,
    reviews: Arc<ReviewQueue>,
    thresholds: QualityThresholds,
}

impl RenderProcessor {
    pub fn new(
        generators: GeneratorRegistry,
        fetcher: Arc<dyn ImageFetcher>,
        blobs: Arc<dyn BlobStore>,
        reviews: Arc<ReviewQueue>,
        thresholds: QualityThresholds,
    ) -> Self {
        Self {
            generators,
            fetcher,
            blobs,
            reviews,
            thresholds,
        }
    }

    /// Run one attempt of a claimed job.
    ///
    /// `Ok` carries the outcome of a render that passed its quality check and
    /// was not auto-rejected. A quality rejection is an `Err` that still
    /// carries the stored image and review in its outcome.
    pub async fn process(&self, record: &JobRecord) -> Result<RenderOutcome, RenderFailure> {
        let job = &record.job;
        let bytes = self.generate(record).await?;

        let (quality, thumbnail) = self.inspect(bytes.clone()).await?;
        tracing::debug!(
            job_id = %job.id,
            score = quality.score,
            passed = quality.passed,
            issues = quality.issues.len(),
            "Quality check finished",
        );

        if let Some(hash) = &quality.metadata.perceptual_hash {
            if let Some(duplicate) = self.reviews.find_duplicate(&job.id, hash).await? {
                tracing::info!(
                    job_id = %job.id,
                    duplicate_of = %duplicate.render_id,
                    similarity = duplicate.similarity,
                    "Duplicate render detected",
                );
                return Err(RenderFailure::new(
                    FailureKind::DuplicateDetected,
                    format!(
                        "Render duplicates {} (similarity {:.3})",
                        duplicate.render_id, duplicate.similarity
                    ),
                ));
            }
        }

        let format = job.settings.format;
        let image_url = self
            .blobs
            .save(&image_path(&job.id, format.extension()), &bytes, format.content_type())
            .await?;
        let thumbnail_url = match thumbnail {
            Some(thumb) => Some(
                self.blobs
                    .save(&thumbnail_path(&job.id), &thumb, "image/png")
                    .await?,
            ),
            None => None,
        };

        let force = requires_manual_review(false, record.attempts_made, &job.settings);
        let passed = quality.passed;
        let score = quality.score;
        let issues = quality.issues.clone();
        let perceptual_hash = quality.metadata.perceptual_hash.clone();

        let review = self
            .reviews
            .add_to_review_queue(
                ReviewEntry {
                    render_id: job.id.clone(),
                    project_id: job.project_id.clone(),
                    image_url: image_url.clone(),
                    thumbnail_url: thumbnail_url.clone(),
                    quality,
                },
                force,
            )
            .await?;

        let outcome = RenderOutcome {
            render_status: RenderStatus::Processing,
            quality_status: match review.status {
                ReviewStatus::Approved | ReviewStatus::AutoApproved => QualityStatus::Approved,
                ReviewStatus::Rejected => QualityStatus::Rejected,
                ReviewStatus::Pending => QualityStatus::Pending,
            },
            image_url: Some(image_url),
            thumbnail_url,
            quality_score: Some(score),
            perceptual_hash,
            error: None,
        };

        if !passed || review.status == ReviewStatus::Rejected {
            let message = if issues.is_empty() {
                format!("Quality score {score:.2} rejected")
            } else {
                format!("Quality check failed: {}", issues.join("; "))
            };
            return Err(
                RenderFailure::new(FailureKind::QualityRejected, message).with_outcome(outcome),
            );
        }
        Ok(outcome)
    }

    async fn generate(&self, record: &JobRecord) -> Result<Vec<u8>, RenderFailure> {
        let provider = record.job.settings.provider;
        let generator = self.generators.get(provider).ok_or_else(|| {
            RenderFailure::new(
                FailureKind::Validation,
                format!("No image generator configured for provider '{}'", provider.as_str()),
            )
        })?;

        let generated = generator
            .generate(&GenerationRequest::from_job(&record.job))
            .await?;
        match generated.data {
            ImageData::Bytes(bytes) => Ok(bytes),
            ImageData::Url(url) => {
                tracing::debug!(job_id = %record.job.id, url = %url, "Fetching generated image");
                Ok(self.fetcher.fetch(&url).await?)
            }
        }
    }

    /// Quality check and thumbnail off the async runtime.
    async fn inspect(
        &self,
        bytes: Vec<u8>,
    ) -> Result<(QualityResult, Option<Vec<u8>>), RenderFailure> {
        let thresholds = self.thresholds.clone();
        tokio::task::spawn_blocking(move || {
            let quality = check_quality(&bytes, &thresholds);
            let thumbnail = make_thumbnail(&bytes).ok();
            (quality, thumbnail)
        })
        .await
        .map_err(|e| RenderFailure::internal(format!("Quality check task failed: {e}")))
    }
}
