//! Review queue: duplicate search, review creation and human decisions.

use std::sync::Arc;

use chrono::Utc;
use verdant_core::job::{QualityStatus, RenderStatus};
use verdant_core::perceptual_hash::{PerceptualHash, DEFAULT_DUPLICATE_THRESHOLD};
use verdant_core::quality::QualityResult;
use verdant_core::review::{decide_initial_status, QualityReview, ReviewDecision, ReviewStatus};
use verdant_core::store::{HashedReview, JobStore, ReviewStore, StoreError};
use verdant_core::types::{new_id, EntityId};
use verdant_events::bus::{REVIEW_APPROVED, REVIEW_CREATED, REVIEW_REJECTED};
use verdant_events::{EventBus, PipelineEvent};

use crate::error::PipelineError;

/// Number of recent hashed reviews searched for duplicates.
pub const DEFAULT_DUPLICATE_WINDOW: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicatePolicy {
    pub threshold: f64,
    pub window: usize,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_DUPLICATE_THRESHOLD,
            window: DEFAULT_DUPLICATE_WINDOW,
        }
    }
}

/// A previously reviewed render that looks like the candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub review_id: EntityId,
    pub render_id: EntityId,
    pub similarity: f64,
}

/// A checked render waiting to become a review.
#[derive(Debug, Clone)]
pub struct ReviewEntry {
    pub render_id: EntityId,
    pub project_id: EntityId,
    pub image_url: String,
    pub thumbnail_url: Option<String>,
    pub quality: QualityResult,
}

pub struct ReviewQueue {
    reviews: Arc<dyn ReviewStore>,
    jobs: Arc<dyn JobStore>,
    events: Arc<EventBus>,
    duplicates: DuplicatePolicy,
}

impl ReviewQueue {
    pub fn new(
        reviews: Arc<dyn ReviewStore>,
        jobs: Arc<dyn JobStore>,
        events: Arc<EventBus>,
        duplicates: DuplicatePolicy,
    ) -> Self {
        Self {
            reviews,
            jobs,
            events,
            duplicates,
        }
    }

    /// Most similar recent review of another render at or above the
    /// duplicate threshold.
    pub async fn find_duplicate(
        &self,
        render_id: &str,
        hash: &PerceptualHash,
    ) -> Result<Option<DuplicateMatch>, PipelineError> {
        let recent = self.reviews.recent_hashes(self.duplicates.window).await?;
        Ok(best_match(render_id, hash, &recent, self.duplicates.threshold))
    }

    /// Create the review for a checked render.
    ///
    /// The initial status follows the score thresholds unless
    /// `force_manual_review` holds the review for a human. A render that
    /// already has a review keeps it.
    pub async fn add_to_review_queue(
        &self,
        entry: ReviewEntry,
        force_manual_review: bool,
    ) -> Result<QualityReview, PipelineError> {
        if let Some(existing) = self.reviews.find_review_by_render(&entry.render_id).await? {
            tracing::info!(
                review_id = %existing.id,
                render_id = %existing.render_id,
                status = %existing.status,
                "Render already reviewed, keeping review",
            );
            return Ok(existing);
        }

        let status = decide_initial_status(
            entry.quality.score,
            entry.quality.passed,
            force_manual_review,
        );
        let review = QualityReview {
            id: new_id(),
            render_id: entry.render_id,
            project_id: entry.project_id,
            image_url: entry.image_url,
            thumbnail_url: entry.thumbnail_url,
            quality_score: entry.quality.score,
            issues: entry.quality.issues,
            status,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            metadata: entry.quality.metadata,
            created_at: Utc::now(),
        };
        self.reviews.insert_review(&review).await?;

        tracing::info!(
            review_id = %review.id,
            render_id = %review.render_id,
            score = review.quality_score,
            status = %review.status,
            force_manual_review,
            "Review created",
        );
        self.events.publish(
            PipelineEvent::new(REVIEW_CREATED)
                .with_subject(review.id.clone())
                .with_payload(serde_json::json!({
                    "render_id": review.render_id,
                    "status": review.status,
                    "quality_score": review.quality_score,
                })),
        );
        Ok(review)
    }

    /// Approve a pending review and mark its render's quality approved.
    pub async fn approve_review(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<QualityReview, PipelineError> {
        let decision = ReviewDecision::approve(reviewer, notes, Utc::now());
        let review = self.decide(review_id, &decision).await?;

        self.update_render(&review.render_id, |outcome| {
            outcome.quality_status = QualityStatus::Approved;
        })
        .await?;

        tracing::info!(review_id, reviewer, render_id = %review.render_id, "Review approved");
        self.events.publish(
            PipelineEvent::new(REVIEW_APPROVED)
                .with_subject(review.id.clone())
                .with_actor(reviewer)
                .with_payload(serde_json::json!({ "render_id": review.render_id })),
        );
        Ok(review)
    }

    /// Reject a pending review and fail its render with the notes as the
    /// error. Credits are not refunded: the render was produced.
    pub async fn reject_review(
        &self,
        review_id: &str,
        reviewer: &str,
        notes: &str,
    ) -> Result<QualityReview, PipelineError> {
        let decision = ReviewDecision::reject(reviewer, notes, Utc::now());
        let review = self.decide(review_id, &decision).await?;

        self.update_render(&review.render_id, |outcome| {
            outcome.render_status = RenderStatus::Failed;
            outcome.quality_status = QualityStatus::Rejected;
            outcome.error = Some(notes.to_string());
        })
        .await?;

        tracing::info!(review_id, reviewer, render_id = %review.render_id, "Review rejected");
        self.events.publish(
            PipelineEvent::new(REVIEW_REJECTED)
                .with_subject(review.id.clone())
                .with_actor(reviewer)
                .with_payload(serde_json::json!({
                    "render_id": review.render_id,
                    "notes": notes,
                })),
        );
        Ok(review)
    }

    pub async fn get(&self, review_id: &str) -> Result<QualityReview, PipelineError> {
        self.reviews
            .get_review(review_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("quality review", review_id))
    }

    pub async fn find_by_render(
        &self,
        render_id: &str,
    ) -> Result<Option<QualityReview>, PipelineError> {
        Ok(self.reviews.find_review_by_render(render_id).await?)
    }

    pub async fn list(
        &self,
        status: Option<ReviewStatus>,
        limit: usize,
    ) -> Result<Vec<QualityReview>, PipelineError> {
        Ok(self.reviews.list_reviews(status, limit).await?)
    }

    // ---- private helpers ----

    async fn decide(
        &self,
        review_id: &str,
        decision: &ReviewDecision,
    ) -> Result<QualityReview, PipelineError> {
        decision.validate()?;
        match self.reviews.decide_review(review_id, decision).await? {
            Some(review) => Ok(review),
            None => {
                let current = self.get(review_id).await?;
                Err(PipelineError::conflict(format!(
                    "Review {review_id} is already '{}'",
                    current.status
                )))
            }
        }
    }

    async fn update_render(
        &self,
        render_id: &str,
        apply: impl FnOnce(&mut verdant_core::job::RenderOutcome),
    ) -> Result<(), PipelineError> {
        let Some(record) = self.jobs.get_job(render_id).await? else {
            // Finished jobs are pruned on a schedule; the review is the
            // remaining record.
            tracing::warn!(render_id, "Render no longer on record, outcome not updated");
            return Ok(());
        };
        let mut outcome = record.outcome;
        apply(&mut outcome);
        match self.jobs.update_outcome(render_id, &outcome).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(render_id, "Render pruned during review, outcome not updated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Highest-similarity entry at or above `threshold`, ignoring reviews of
/// `render_id` itself.
fn best_match(
    render_id: &str,
    hash: &PerceptualHash,
    recent: &[HashedReview],
    threshold: f64,
) -> Option<DuplicateMatch> {
    recent
        .iter()
        .filter(|r| r.render_id != render_id)
        .map(|r| (r, hash.similarity(&r.perceptual_hash)))
        .filter(|(_, similarity)| *similarity >= threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(r, similarity)| DuplicateMatch {
            review_id: r.review_id.clone(),
            render_id: r.render_id.clone(),
            similarity,
        })
}
