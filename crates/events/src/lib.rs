//! Pipeline event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PipelineEvent`]: the event envelope.
//! - [`EventLogger`]: background subscriber that traces every event.

pub mod bus;
pub mod logger;

pub use bus::{EventBus, PipelineEvent};
pub use logger::EventLogger;
