//! In-process pipeline event bus backed by a `tokio::sync::broadcast` channel.
//!
//! Shared via `Arc<EventBus>` between the submission surface, the review
//! queue and the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use verdant_core::types::EntityId;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const RENDER_QUEUED: &str = "render.queued";
pub const RENDER_COMPLETED: &str = "render.completed";
pub const RENDER_FAILED: &str = "render.failed";
pub const RENDER_CANCELLED: &str = "render.cancelled";
pub const REVIEW_CREATED: &str = "review.created";
pub const REVIEW_APPROVED: &str = "review.approved";
pub const REVIEW_REJECTED: &str = "review.rejected";
pub const CREDITS_REFUNDED: &str = "credits.refunded";

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Something that happened to a render, a review, or an organization's
/// credits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Dot-separated event name, e.g. `"render.completed"`.
    pub event_type: String,

    /// Id of the render or review the event is about.
    pub subject_id: Option<EntityId>,

    pub organization_id: Option<EntityId>,

    /// User (or reviewer) whose action caused the event.
    pub actor_id: Option<EntityId>,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subject_id: None,
            organization_id: None,
            actor_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_subject(mut self, id: impl Into<EntityId>) -> Self {
        self.subject_id = Some(id.into());
        self
    }

    pub fn with_organization(mut self, id: impl Into<EntityId>) -> Self {
        self.organization_id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, id: impl Into<EntityId>) -> Self {
        self.actor_id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out bus; every subscriber sees every event published after it
/// subscribed.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Slow receivers past `capacity` observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // A send error only means nobody is subscribed.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_enriched_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            PipelineEvent::new(RENDER_COMPLETED)
                .with_subject("render-1")
                .with_organization("org-1")
                .with_actor("user-1")
                .with_payload(serde_json::json!({"quality_score": 0.91})),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "render.completed");
        assert_eq!(received.subject_id.as_deref(), Some("render-1"));
        assert_eq!(received.organization_id.as_deref(), Some("org-1"));
        assert_eq!(received.actor_id.as_deref(), Some("user-1"));
        assert_eq!(received.payload["quality_score"], 0.91);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(PipelineEvent::new(CREDITS_REFUNDED));

        assert_eq!(a.recv().await.unwrap().event_type, CREDITS_REFUNDED);
        assert_eq!(b.recv().await.unwrap().event_type, CREDITS_REFUNDED);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::default().publish(PipelineEvent::new(RENDER_QUEUED));
    }
}
