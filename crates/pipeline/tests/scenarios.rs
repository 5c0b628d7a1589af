//! End-to-end behaviour of the render pipeline on the in-memory store.

mod common;

use assert_matches::assert_matches;
use common::{flat_png, good_png, request, submitter, Harness, ORG};
use verdant_core::credits::TransactionKind;
use verdant_core::job::{QualityStatus, RenderStatus};
use verdant_core::review::ReviewStatus;
use verdant_core::scheduling::{FailureKind, JobState};
use verdant_core::tier::SubscriptionTier;
use verdant_events::bus::{CREDITS_REFUNDED, RENDER_COMPLETED, RENDER_QUEUED, REVIEW_CREATED};
use verdant_pipeline::generator::{GeneratedImage, GenerationError};
use verdant_pipeline::{PipelineError, Settlement, SubmissionError};

// ---------------------------------------------------------------------------
// Submission scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn starter_render_costs_one_credit_and_queues_at_priority_five() {
    let h = Harness::new(good_png(), 10).await;

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Starter))
        .await
        .unwrap();

    assert_eq!(handle.cost, 1);
    assert_eq!(handle.priority, 5);
    assert_eq!(handle.state, JobState::Waiting);
    assert_eq!(h.used().await, 1);

    let txs = h.services.ledger.transactions(ORG, 10).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].kind, TransactionKind::Consume);
    assert_eq!(txs[0].render_id, handle.id);
}

#[tokio::test]
async fn growth_4k_high_quality_render_costs_five() {
    let h = Harness::new(good_png(), 5).await;

    let handle = h
        .services
        .submissions
        .submit(request(4096, 4096, 90), submitter("gina", SubscriptionTier::Growth))
        .await
        .unwrap();

    assert_eq!(handle.cost, 5);
    assert_eq!(handle.priority, 1);
    let quota = h.services.ledger.check_quota(ORG).await.unwrap();
    assert_eq!(quota.remaining, 0);
}

#[tokio::test]
async fn insufficient_credits_rejects_without_enqueueing() {
    let h = Harness::new(good_png(), 1).await;

    let err = h
        .services
        .submissions
        .submit(request(4096, 4096, 90), submitter("gina", SubscriptionTier::Growth))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        SubmissionError::InsufficientCredits {
            required: 5,
            remaining: 1
        }
    );
    assert_eq!(err.code(), "insufficient_credits");
    assert_eq!(h.used().await, 0);
    assert!(h.services.queue.claim_next("w").await.unwrap().is_none());
}

#[tokio::test]
async fn third_starter_submission_in_a_minute_is_rate_limited() {
    let h = Harness::new(good_png(), 10).await;
    let who = || submitter("sam", SubscriptionTier::Starter);

    h.services.submissions.submit(request(1024, 1024, 60), who()).await.unwrap();
    h.services.submissions.submit(request(1024, 1024, 60), who()).await.unwrap();
    let err = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), who())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "rate_limited");
    assert!(err.to_string().contains("minute"));
    // The denied submission was never charged.
    assert_eq!(h.used().await, 2);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_charging() {
    let h = Harness::new(good_png(), 10).await;
    let mut bad = request(1024, 1024, 60);
    bad.prompt.user = "   ".to_string();

    let err = h
        .services
        .submissions
        .submit(bad, submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "invalid_input");
    assert_eq!(h.used().await, 0);
}

#[tokio::test]
async fn higher_tier_jobs_are_claimed_first() {
    let h = Harness::new(good_png(), 10).await;

    let starter = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("s", SubscriptionTier::Starter))
        .await
        .unwrap();
    let growth = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("g", SubscriptionTier::Growth))
        .await
        .unwrap();

    let first = h.services.queue.claim_next("w").await.unwrap().unwrap();
    let second = h.services.queue.claim_next("w").await.unwrap().unwrap();
    assert_eq!(first.id(), &growth.id);
    assert_eq!(second.id(), &starter.id);
}

// ---------------------------------------------------------------------------
// Worker scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn good_render_completes_and_is_auto_approved() {
    let h = Harness::new(good_png(), 10).await;
    let mut events = h.services.events.subscribe();

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    let (_, settlement) = h.run_next().await.unwrap();
    assert_eq!(settlement, Settlement::Completed);

    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.outcome.render_status, RenderStatus::Completed);
    assert_eq!(job.outcome.quality_status, QualityStatus::Approved);
    assert_eq!(job.outcome.quality_score, Some(1.0));
    assert_eq!(
        job.outcome.image_url.as_deref(),
        Some(format!("https://blobs.test/renders/{}.png", handle.id).as_str())
    );
    assert!(h.blob_dir.path().join(format!("renders/{}.png", handle.id)).exists());
    assert!(h.blob_dir.path().join(format!("renders/{}_thumb.png", handle.id)).exists());

    let review = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::AutoApproved);
    assert!(review.metadata.perceptual_hash.is_some());

    // Credits stay consumed for a delivered render.
    assert_eq!(h.used().await, 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(seen, vec![RENDER_QUEUED, REVIEW_CREATED, RENDER_COMPLETED]);
}

#[tokio::test]
async fn low_quality_render_is_rejected_and_refunded() {
    let h = Harness::new(flat_png(), 10).await;

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    let (_, settlement) = h.run_next().await.unwrap();
    assert_eq!(settlement, Settlement::Failed { refunded: true });

    let review = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::Rejected);
    assert!((review.quality_score - 0.5).abs() < 1e-9);
    assert!(!review.issues.is_empty());

    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.outcome.render_status, RenderStatus::Failed);
    assert_eq!(job.outcome.quality_status, QualityStatus::Rejected);
    assert!(job.outcome.image_url.is_some());
    assert!(job.outcome.error.as_deref().unwrap().starts_with("Quality check failed"));

    assert_eq!(h.used().await, 0);
    let txs = h.services.ledger.transactions(ORG, 10).await.unwrap();
    assert_eq!(txs[0].kind, TransactionKind::Refund);
}

#[tokio::test]
async fn duplicate_render_is_refunded_without_a_review() {
    let h = Harness::new(good_png(), 10).await;
    let who = || submitter("alice", SubscriptionTier::Pro);

    let first = h.services.submissions.submit(request(1024, 1024, 60), who()).await.unwrap();
    let second = h.services.submissions.submit(request(1024, 1024, 60), who()).await.unwrap();

    let (_, settled) = h.run_next().await.unwrap();
    assert_eq!(settled, Settlement::Completed);
    let (_, settled) = h.run_next().await.unwrap();
    assert_eq!(settled, Settlement::Failed { refunded: true });

    let job = h.services.queue.get(&second.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    let error = job.outcome.error.unwrap();
    assert!(error.contains(&first.id), "{error}");

    assert!(h.services.reviews.find_by_render(&second.id).await.unwrap().is_none());
    assert_eq!(h.services.reviews.list(None, 10).await.unwrap().len(), 1);
    assert_eq!(h.used().await, 1);
}

#[tokio::test]
async fn transient_failure_is_retried_and_forced_to_manual_review() {
    let h = Harness::new(good_png(), 10).await;
    h.generator.push(Err(GenerationError::Transient("HTTP 503".into())));

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    let (_, settled) = h.run_next().await.unwrap();
    assert_matches!(settled, Settlement::RetryScheduled { .. });
    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Delayed);

    let (record, settled) = h.run_next().await.unwrap();
    assert_eq!(record.attempts_made, 2);
    assert_eq!(settled, Settlement::Completed);

    // A retried render always waits for a human.
    let review = h.services.reviews.find_by_render(&handle.id).await.unwrap().unwrap();
    assert_eq!(review.status, ReviewStatus::Pending);
    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert_eq!(job.outcome.quality_status, QualityStatus::Pending);
    assert_eq!(h.used().await, 1);
    assert_eq!(h.generator.calls().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_fail_and_refund() {
    let h = Harness::new(good_png(), 10).await;
    for _ in 0..3 {
        h.generator.push(Err(GenerationError::Transient("timeout".into())));
    }
    let mut events = h.services.events.subscribe();

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    let mut settlements = Vec::new();
    while let Some((_, settled)) = h.run_next().await {
        settlements.push(settled);
    }
    assert_eq!(settlements.len(), 3);
    assert_eq!(settlements[2], Settlement::Failed { refunded: true });

    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(h.used().await, 0);

    let mut refunded = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == CREDITS_REFUNDED {
            refunded += 1;
        }
    }
    assert_eq!(refunded, 1);
}

#[tokio::test]
async fn validation_failure_is_not_retried() {
    let h = Harness::new(good_png(), 10).await;
    h.generator.push(Err(GenerationError::Validation("content policy".into())));

    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    let (record, settled) = h.run_next().await.unwrap();
    assert_eq!(record.attempts_made, 1);
    assert_eq!(settled, Settlement::Failed { refunded: true });
    assert!(h.run_next().await.is_none());

    let job = h.services.queue.get(&handle.id).await.unwrap();
    assert!(job.outcome.error.unwrap().contains("content policy"));
    assert_eq!(h.used().await, 0);
}

#[tokio::test]
async fn url_results_are_downloaded() {
    let h = Harness::new(good_png(), 10).await;
    h.generator
        .push(Ok(GeneratedImage::from_url("https://provider.test/out/1.png")));

    h.services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    let (_, settled) = h.run_next().await.unwrap();
    assert_eq!(settled, Settlement::Completed);
}

#[tokio::test]
async fn generator_sees_prompt_and_settings() {
    let h = Harness::new(good_png(), 10).await;
    let handle = h
        .services
        .submissions
        .submit(request(2048, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    h.run_next().await.unwrap();

    let calls = h.generator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].render_id, handle.id);
    assert_eq!(calls[0].prompt.user, "Add a flagstone patio");
    assert_eq!(calls[0].settings.resolution.width, 2048);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_queued_render_refunds_it() {
    let h = Harness::new(good_png(), 10).await;
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();

    let cancelled = h.services.queue.cancel(&handle.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(h.used().await, 0);
    assert!(h.run_next().await.is_none());

    let again = h.services.queue.cancel(&handle.id).await.unwrap_err();
    assert_matches!(again, PipelineError::Core(verdant_core::error::CoreError::Conflict(_)));
}

#[tokio::test]
async fn active_renders_cannot_be_cancelled() {
    let h = Harness::new(good_png(), 10).await;
    let handle = h
        .services
        .submissions
        .submit(request(1024, 1024, 60), submitter("alice", SubscriptionTier::Pro))
        .await
        .unwrap();
    h.services.queue.claim_next("w").await.unwrap().unwrap();

    assert!(h.services.queue.cancel(&handle.id).await.is_err());
    assert_eq!(h.used().await, 1);
}

#[tokio::test]
async fn unknown_render_is_not_found() {
    let h = Harness::new(good_png(), 10).await;
    let err = h.services.queue.get("missing").await.unwrap_err();
    assert_matches!(
        err,
        PipelineError::Core(verdant_core::error::CoreError::NotFound { .. })
    );
}

#[test]
fn failure_kinds_used_by_the_worker_are_permanent() {
    for kind in [
        FailureKind::Validation,
        FailureKind::QualityRejected,
        FailureKind::DuplicateDetected,
    ] {
        assert!(!kind.is_retryable());
    }
}
