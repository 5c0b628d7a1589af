//! Human review decisions, stalled-job recovery and retention.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use common::{good_png, request, submitter, Harness};
use verdant_core::error::CoreError;
use verdant_core::job::{QualityStatus, RenderStatus};
use verdant_core::review::ReviewStatus;
use verdant_core::scheduling::{JobState, RetryPolicy};
use verdant_core::tier::SubscriptionTier;
use verdant_pipeline::queue::PruneReport;
use verdant_pipeline::{PipelineError, RenderQueue, Settlement};

/// Submit a quality-80 render (forced to manual review) and run it.
async fn pending_review(h: &Harness) -> (String, String) {
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 80), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    let (_, settled) = h.run_next().await.unwrap();
    assert_eq!(settled, Settlement::Completed);

    let review = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::Pending);
    (handle.id, review.id)
}

// ---------------------------------------------------------------------------
// Review decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approving_marks_render_quality_approved() {
    let h = Harness::new(good_png(), 10).await;
    let (render_id, review_id) = pending_review(&h).await;

    let review = h
        .services
        .reviews
        .approve_review(&review_id, "reviewer-1", Some("Looks great".into()))
        .await
        .unwrap();
    assert_eq!(review.status, ReviewStatus::Approved);
    assert_eq!(review.reviewed_by.as_deref(), Some("reviewer-1"));
    assert!(review.reviewed_at.is_some());

    let job = h.services.queue.get(&render_id).await.unwrap();
    assert_eq!(job.outcome.quality_status, QualityStatus::Approved);
    assert_eq!(job.outcome.render_status, RenderStatus::Completed);
}

#[tokio::test]
async fn rejecting_fails_render_without_refund() {
    let h = Harness::new(good_png(), 10).await;
    let (render_id, review_id) = pending_review(&h).await;
    // 1 base + 1 for quality above 75
    assert_eq!(h.used().await, 2);

    let review = h
        .services
        .reviews
        .reject_review(&review_id, "reviewer-1", "Hedge is floating")
        .await
        .unwrap();
    assert_eq!(review.status, ReviewStatus::Rejected);
    assert_eq!(review.review_notes.as_deref(), Some("Hedge is floating"));

    let job = h.services.queue.get(&render_id).await.unwrap();
    assert_eq!(job.outcome.render_status, RenderStatus::Failed);
    assert_eq!(job.outcome.quality_status, QualityStatus::Rejected);
    assert_eq!(job.outcome.error.as_deref(), Some("Hedge is floating"));
    assert_eq!(h.used().await, 2);
}

#[tokio::test]
async fn decided_reviews_cannot_be_decided_again() {
    let h = Harness::new(good_png(), 10).await;
    let (_, review_id) = pending_review(&h).await;

    h.services
        .reviews
        .approve_review(&review_id, "reviewer-1", None)
        .await
        .unwrap();
    let err = h
        .services
        .reviews
        .reject_review(&review_id, "reviewer-2", "changed my mind")
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Core(CoreError::Conflict(_)));
}

#[tokio::test]
async fn rejection_requires_notes() {
    let h = Harness::new(good_png(), 10).await;
    let (_, review_id) = pending_review(&h).await;

    let err = h
        .services
        .reviews
        .reject_review(&review_id, "reviewer-1", "  ")
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Core(CoreError::Validation(_)));

    let review = h.services.reviews.get(&review_id).await.unwrap();
    assert_eq!(review.status, ReviewStatus::Pending);
}

#[tokio::test]
async fn list_filters_by_status() {
    let h = Harness::new(good_png(), 10).await;
    pending_review(&h).await;

    let pending = h
        .services
        .reviews
        .list(Some(ReviewStatus::Pending), 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let approved = h
        .services
        .reviews
        .list(Some(ReviewStatus::AutoApproved), 10)
        .await
        .unwrap();
    assert!(approved.is_empty());
}

// ---------------------------------------------------------------------------
// Stalled jobs
// ---------------------------------------------------------------------------

fn short_lease_queue(h: &Harness, max_attempts: u32) -> RenderQueue {
    RenderQueue::new(h.store.clone(), h.services.ledger.clone(), h.services.events.clone())
        .with_retry_policy(RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        })
        .with_lease(Duration::ZERO)
}

#[tokio::test]
async fn stalled_job_with_attempts_left_is_requeued() {
    let h = Harness::new(good_png(), 10).await;
    let queue = short_lease_queue(&h, 3);
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    queue.claim_next("dead-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(queue.recover_stalled().await.unwrap(), 1);
    let job = queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(h.used().await, 1);
}

#[tokio::test]
async fn stalled_job_on_last_attempt_fails_and_refunds() {
    let h = Harness::new(good_png(), 10).await;
    let queue = short_lease_queue(&h, 1);
    let job = verdant_core::render::RenderJob::from_request(
        request(1024, 1024, 60),
        submitter("alice", SubscriptionTier::Pro),
    )
    .unwrap();
    let charge = verdant_pipeline::ledger::Charge {
        organization_id: &job.organization_id,
        user_id: &job.user_id,
        render_id: &job.id,
    };
    assert!(h.services.ledger.consume(charge, &job.settings).await.unwrap());
    let handle = queue.submit(job, 1).await.unwrap();

    queue.claim_next("dead-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(queue.recover_stalled().await.unwrap(), 1);
    let job = queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(h.used().await, 0);
}

#[tokio::test]
async fn retry_after_stall_is_not_a_duplicate_of_its_own_review() {
    let h = Harness::new(good_png(), 10).await;
    let queue = short_lease_queue(&h, 3);
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    // The first attempt creates its review, then the worker dies before
    // settling.
    let first = queue.claim_next("dead-worker").await.unwrap().unwrap();
    h.services.processor.process(&first).await.unwrap();
    let review = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.recover_stalled().await.unwrap(), 1);

    let retry = h.services.queue.claim_next("w2").await.unwrap().unwrap();
    assert_eq!(retry.attempts_made, 2);
    let result = h.services.processor.process(&retry).await;
    assert_matches!(&result, Ok(_));
    let settled = h.services.queue.settle(&retry, result).await.unwrap();
    assert_eq!(settled, Settlement::Completed);

    let kept = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    assert_eq!(kept.id, review.id);
    assert_eq!(h.services.reviews.list(None, 10).await.unwrap().len(), 1);
    assert_eq!(h.used().await, 1);
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_jobs_older_than_an_hour_are_pruned() {
    let h = Harness::new(good_png(), 10).await;
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    h.run_next().await.unwrap();

    let report = h.services.queue.prune(Utc::now()).await.unwrap();
    assert_eq!(report, PruneReport::default());

    let later = Utc::now() + chrono::Duration::hours(2);
    let report = h.services.queue.prune(later).await.unwrap();
    assert_eq!(report.completed, 1);
    assert!(h.services.queue.get(&handle.id).await.is_err());

    // The review outlives the job.
    assert!(h.services.reviews.find_by_render(&handle.id).await.unwrap().is_some());
}

#[tokio::test]
async fn review_decision_survives_pruned_render() {
    let h = Harness::new(good_png(), 10).await;
    let (_, review_id) = pending_review(&h).await;
    h.services
        .queue
        .prune(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();

    let review = h
        .services
        .reviews
        .approve_review(&review_id, "reviewer-1", None)
        .await
        .unwrap();
    assert_eq!(review.status, ReviewStatus::Approved);
}

#[tokio::test]
async fn queue_is_shareable_across_tasks() {
    let h = Harness::new(good_png(), 10).await;
    let queue: Arc<RenderQueue> = h.services.queue.clone();
    let task = tokio::spawn(async move { queue.claim_next("w").await.unwrap() });
    assert!(task.await.unwrap().is_none());
}
