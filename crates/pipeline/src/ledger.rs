//! Credit ledger service.
//!
//! Prices renders, reserves credits at submission and returns them when a
//! render fails for a refundable reason. Atomicity lives in the
//! [`LedgerStore`]; this layer builds transactions and publishes events.

use std::sync::Arc;

use chrono::Utc;
use verdant_core::credits::{self, ConsumeOutcome, CreditTransaction, QuotaStatus, TransactionKind};
use verdant_core::render::RenderSettings;
use verdant_core::store::LedgerStore;
use verdant_core::types::new_id;
use verdant_events::bus::CREDITS_REFUNDED;
use verdant_events::{EventBus, PipelineEvent};

use crate::error::PipelineError;

/// Who a credit movement is attributed to.
#[derive(Debug, Clone, Copy)]
pub struct Charge<'a> {
    pub organization_id: &'a str,
    pub user_id: &'a str,
    pub render_id: &'a str,
}

pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    events: Arc<EventBus>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub fn calculate_cost(&self, settings: &RenderSettings) -> u32 {
        credits::calculate_cost(settings)
    }

    /// Reserve the cost of a render. Returns `false` when the organization
    /// does not have enough credits left.
    pub async fn consume(
        &self,
        charge: Charge<'_>,
        settings: &RenderSettings,
    ) -> Result<bool, PipelineError> {
        let outcome = self.try_consume(charge, settings).await?;
        Ok(matches!(outcome, ConsumeOutcome::Consumed(_)))
    }

    /// Like [`consume`](Self::consume) but reports the quota either way.
    pub async fn try_consume(
        &self,
        charge: Charge<'_>,
        settings: &RenderSettings,
    ) -> Result<ConsumeOutcome, PipelineError> {
        let cost = self.calculate_cost(settings);
        let now = Utc::now();
        let description = format!("Render {}", charge.render_id);
        let tx = transaction(charge, cost, TransactionKind::Consume, description, now);

        let outcome = self.store.try_consume(&tx, now).await?;
        match &outcome {
            ConsumeOutcome::Consumed(quota) => tracing::info!(
                organization_id = charge.organization_id,
                render_id = charge.render_id,
                cost,
                remaining = quota.remaining,
                "Credits consumed",
            ),
            ConsumeOutcome::Insufficient(quota) => tracing::info!(
                organization_id = charge.organization_id,
                render_id = charge.render_id,
                cost,
                remaining = quota.remaining,
                "Insufficient credits",
            ),
        }
        Ok(outcome)
    }

    /// Return the cost of a render. Only the first refund per render is
    /// applied; returns whether this call applied it.
    pub async fn refund(
        &self,
        charge: Charge<'_>,
        settings: &RenderSettings,
        reason: &str,
    ) -> Result<bool, PipelineError> {
        self.refund_amount(charge, self.calculate_cost(settings), reason).await
    }

    /// Refund a known amount, e.g. the cost recorded on a job.
    pub async fn refund_amount(
        &self,
        charge: Charge<'_>,
        amount: u32,
        reason: &str,
    ) -> Result<bool, PipelineError> {
        let now = Utc::now();
        let tx = transaction(charge, amount, TransactionKind::Refund, reason.to_string(), now);

        let applied = self.store.refund_once(&tx, now).await?;
        if applied {
            tracing::info!(
                organization_id = charge.organization_id,
                render_id = charge.render_id,
                amount,
                reason,
                "Credits refunded",
            );
            self.events.publish(
                PipelineEvent::new(CREDITS_REFUNDED)
                    .with_subject(charge.render_id)
                    .with_organization(charge.organization_id)
                    .with_actor(charge.user_id)
                    .with_payload(serde_json::json!({ "amount": amount, "reason": reason })),
            );
        } else {
            tracing::debug!(render_id = charge.render_id, "Refund already applied");
        }
        Ok(applied)
    }

    pub async fn check_quota(&self, organization_id: &str) -> Result<QuotaStatus, PipelineError> {
        Ok(self.store.get_quota(organization_id, Utc::now()).await?)
    }

    pub async fn set_quota_total(
        &self,
        organization_id: &str,
        total: u32,
    ) -> Result<QuotaStatus, PipelineError> {
        let quota = self.store.set_quota_total(organization_id, total, Utc::now()).await?;
        tracing::info!(organization_id, total, "Quota provisioned");
        Ok(quota)
    }

    pub async fn transactions(
        &self,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, PipelineError> {
        Ok(self.store.list_transactions(organization_id, limit).await?)
    }
}

fn transaction(
    charge: Charge<'_>,
    amount: u32,
    kind: TransactionKind,
    description: String,
    now: chrono::DateTime<Utc>,
) -> CreditTransaction {
    CreditTransaction {
        id: new_id(),
        organization_id: charge.organization_id.to_string(),
        user_id: charge.user_id.to_string(),
        render_id: charge.render_id.to_string(),
        amount,
        kind,
        description,
        created_at: now,
    }
}
