//! Background subscriber that writes every pipeline event to the trace log.

use tokio::sync::broadcast;

use crate::bus::PipelineEvent;

pub struct EventLogger;

impl EventLogger {
    /// Log events until the bus is dropped.
    pub async fn run(mut receiver: broadcast::Receiver<PipelineEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    tracing::info!(
                        event_type = %event.event_type,
                        subject_id = event.subject_id.as_deref().unwrap_or("-"),
                        organization_id = event.organization_id.as_deref().unwrap_or("-"),
                        payload = %event.payload,
                        "Pipeline event",
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("Event bus closed, event logger stopping");
                    break;
                }
            }
        }
    }
}
