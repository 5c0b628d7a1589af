//! Simultaneous submissions from one user must not overrun the tier limits.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{request, submitter, ORG};
use verdant_core::admission::AdmissionDecision;
use verdant_core::job::{JobRecord, RenderOutcome};
use verdant_core::scheduling::{JobState, RetentionPolicy};
use verdant_core::store::{JobStore, StalledRecovery, StoreError};
use verdant_core::tier::SubscriptionTier;
use verdant_core::types::Timestamp;
use verdant_db::MemoryStore;
use verdant_events::EventBus;
use verdant_pipeline::{
    AdmissionController, CreditLedger, RenderQueue, SubmissionError, SubmissionService,
};

/// Job store whose reads of the admission counts are slow, so every
/// concurrent caller sees the counts from before any of them inserted.
struct SlowCounts {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl JobStore for SlowCounts {
    async fn insert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.inner.insert_job(record).await
    }

    async fn insert_job_if_admitted(
        &self,
        record: &JobRecord,
        now: Timestamp,
    ) -> Result<AdmissionDecision, StoreError> {
        self.inner.insert_job_if_admitted(record, now).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.inner.claim_next(worker_id, now, lease_until).await
    }

    async fn finish_job(
        &self,
        id: &str,
        state: JobState,
        outcome: &RenderOutcome,
        now: Timestamp,
    ) -> Result<JobRecord, StoreError> {
        self.inner.finish_job(id, state, outcome, now).await
    }

    async fn schedule_retry(
        &self,
        id: &str,
        run_at: Timestamp,
        error: &str,
    ) -> Result<JobRecord, StoreError> {
        self.inner.schedule_retry(id, run_at, error).await
    }

    async fn cancel_job(&self, id: &str, now: Timestamp) -> Result<Option<JobRecord>, StoreError> {
        self.inner.cancel_job(id, now).await
    }

    async fn update_outcome(&self, id: &str, outcome: &RenderOutcome) -> Result<(), StoreError> {
        self.inner.update_outcome(id, outcome).await
    }

    async fn count_user_jobs_since(
        &self,
        user_id: &str,
        states: &[JobState],
        since: Timestamp,
    ) -> Result<u64, StoreError> {
        let count = self.inner.count_user_jobs_since(user_id, states, since).await;
        tokio::time::sleep(self.delay).await;
        count
    }

    async fn prune_finished(
        &self,
        state: JobState,
        policy: RetentionPolicy,
        now: Timestamp,
    ) -> Result<u64, StoreError> {
        self.inner.prune_finished(state, policy, now).await
    }

    async fn recover_stalled(&self, now: Timestamp) -> Result<StalledRecovery, StoreError> {
        self.inner.recover_stalled(now).await
    }
}

struct Setup {
    store: Arc<MemoryStore>,
    ledger: Arc<CreditLedger>,
    submissions: SubmissionService,
}

async fn setup(quota: u32) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let jobs = Arc::new(SlowCounts {
        inner: store.clone(),
        delay: Duration::from_millis(5),
    });
    let events = Arc::new(EventBus::default());
    let ledger = Arc::new(CreditLedger::new(store.clone(), events.clone()));
    ledger.set_quota_total(ORG, quota).await.unwrap();
    let queue = Arc::new(RenderQueue::new(jobs.clone(), ledger.clone(), events));
    let submissions = SubmissionService::new(
        Arc::new(AdmissionController::new(jobs)),
        ledger.clone(),
        queue,
    );
    Setup {
        store,
        ledger,
        submissions,
    }
}

#[tokio::test]
async fn simultaneous_starter_submissions_admit_only_two() {
    let s = setup(10).await;
    let submit = || {
        s.submissions
            .submit(request(1024, 1024, 60), submitter("sam", SubscriptionTier::Starter))
    };

    let (a, b, c, d, e) = tokio::join!(submit(), submit(), submit(), submit(), submit());
    let results = [a, b, c, d, e];

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 2);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err, SubmissionError::RateLimited(_)), "{err:?}");
    }

    let since = chrono::Utc::now() - chrono::Duration::hours(2);
    let stored = s
        .store
        .count_user_jobs_since("sam", &JobState::IN_FLIGHT, since)
        .await
        .unwrap();
    assert_eq!(stored, 2);

    // Losers were charged by the pre-check race and refunded.
    let quota = s.ledger.check_quota(ORG).await.unwrap();
    assert_eq!(quota.used, 2);
    assert_eq!(quota.remaining, 8);
}

#[tokio::test]
async fn simultaneous_submissions_from_different_users_are_independent() {
    let s = setup(10).await;
    let submit = |user: &'static str| {
        s.submissions
            .submit(request(1024, 1024, 60), submitter(user, SubscriptionTier::Starter))
    };

    let (a, b, c, d) = tokio::join!(submit("sam"), submit("sam"), submit("kim"), submit("kim"));

    assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
    assert_eq!(s.ledger.check_quota(ORG).await.unwrap().used, 4);
}
