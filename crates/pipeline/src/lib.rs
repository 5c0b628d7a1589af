//! Render pipeline services.
//!
//! Submission ([`SubmissionService`]) validates, admits and charges a render
//! before it lands in the [`RenderQueue`]. Workers claim jobs and run them
//! through the [`RenderProcessor`], which generates the image, checks its
//! quality, searches for duplicates, stores it and opens a review in the
//! [`ReviewQueue`]. The [`CreditLedger`] prices, charges and refunds.

pub mod admission;
pub mod blob;
pub mod config;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod processor;
pub mod queue;
pub mod review_queue;
pub mod services;
pub mod submission;

pub use admission::AdmissionController;
pub use blob::{BlobStore, LocalBlobStore};
pub use config::{ConfigError, PipelineConfig};
pub use error::{PipelineError, RenderFailure, SubmissionError};
pub use generator::{GeneratorRegistry, ImageFetcher, ImageGenerator};
pub use ledger::CreditLedger;
pub use processor::RenderProcessor;
pub use queue::{Enqueued, JobHandle, RenderQueue, Settlement};
pub use review_queue::ReviewQueue;
pub use services::{Collaborators, PipelineServices, ServiceSettings};
pub use submission::SubmissionService;
