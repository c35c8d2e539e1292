//! Image processors and the registry that maps operation names to them.
//!
//! A processor validates its parameters without the image, then executes the
//! transformation against the decoded source. Checks that depend on the
//! source (such as crop bounds) happen in `process`.

use image::DynamicImage;

use crate::models::job::JobParams;

pub mod crop;
pub mod registry;
pub mod resize;

pub use crop::CropProcessor;
pub use registry::ProcessorRegistry;
pub use resize::ResizeProcessor;

/// An image transformation selected by a job's `type`.
pub trait Processor: Send + Sync {
    /// Operation identifier, matching `Job::job_type`.
    fn name(&self) -> &str;

    /// Check parameter presence and ranges without needing the image.
    fn validate_params(&self, params: &JobParams) -> Result<(), ProcessorError>;

    /// Apply the transformation, re-validating against the source image.
    fn process(
        &self,
        image: &DynamicImage,
        params: &JobParams,
    ) -> Result<DynamicImage, ProcessorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("Processor not found: {0}")]
    NotFound(String),

    #[error("Processor already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Invalid parameters: {0}")]
    ValidationFailed(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

impl ProcessorError {
    fn mismatched(processor: &str, params: &JobParams) -> Self {
        ProcessorError::ValidationFailed(format!(
            "{} processor received {} parameters",
            processor,
            params.kind()
        ))
    }
}

impl From<garde::Report> for ProcessorError {
    fn from(report: garde::Report) -> Self {
        ProcessorError::ValidationFailed(report.to_string().trim().to_string())
    }
}
