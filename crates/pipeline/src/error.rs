//! Error types for the pipeline services.

use verdant_core::error::CoreError;
use verdant_core::job::RenderOutcome;
use verdant_core::scheduling::FailureKind;
use verdant_core::store::StoreError;

use crate::blob::BlobError;
use crate::generator::GenerationError;

/// Errors from queue, ledger and review operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Core(CoreError::NotFound {
            entity,
            id: id.into(),
        })
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Core(CoreError::Conflict(message.into()))
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Why a submission was turned away. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("{0}")]
    RateLimited(String),

    #[error("Insufficient credits: {required} required, {remaining} remaining")]
    InsufficientCredits { required: u32, remaining: u32 },

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SubmissionError {
    /// Wire code reported to the caller.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::InvalidInput(_) => "invalid_input",
            Self::Pipeline(_) => "internal",
        }
    }
}

impl From<CoreError> for SubmissionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::InvalidInput(msg),
            other => Self::Pipeline(PipelineError::Core(other)),
        }
    }
}

impl From<StoreError> for SubmissionError {
    fn from(err: StoreError) -> Self {
        Self::Pipeline(PipelineError::Store(err))
    }
}

// ---------------------------------------------------------------------------
// Render attempt failure
// ---------------------------------------------------------------------------

/// A failed render attempt. Retry and refund are decided on `kind`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RenderFailure {
    pub kind: FailureKind,
    pub message: String,
    /// What the attempt produced before failing, if anything worth keeping
    /// (a quality-rejected render still has an image and a review).
    pub outcome: Option<RenderOutcome>,
}

impl RenderFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: RenderOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

impl From<GenerationError> for RenderFailure {
    fn from(err: GenerationError) -> Self {
        let kind = match err {
            GenerationError::Transient(_) => FailureKind::Transient,
            GenerationError::Validation(_) => FailureKind::Validation,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<BlobError> for RenderFailure {
    fn from(err: BlobError) -> Self {
        Self::new(FailureKind::Transient, err.to_string())
    }
}

impl From<StoreError> for RenderFailure {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::Backend(_) => FailureKind::Transient,
            StoreError::NotFound { .. } | StoreError::Conflict(_) => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<PipelineError> for RenderFailure {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Store(e) => e.into(),
            PipelineError::Core(e) => Self::internal(e.to_string()),
        }
    }
}
