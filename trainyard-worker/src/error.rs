//! Step errors and failure classification
//!
//! Steps report typed errors; the scheduler sees an `anyhow::Error` chain
//! and maps it to the single `JobFailureType` stored on the failed job.

use std::io;

use thiserror::Error;
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::workflow::WorkflowError;
use trainyard_core::store::StoreError;

use crate::process::ProcessError;
use crate::steps::RegistryError;

/// Step runner error type
#[derive(Debug, Error)]
pub enum StepError {
    /// A failure the runner has already classified
    #[error("{message}")]
    Typed {
        failure_type: JobFailureType,
        message: String,
    },

    #[error("invalid step configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StepError {
    pub fn typed(failure_type: JobFailureType, message: impl Into<String>) -> Self {
        StepError::Typed {
            failure_type,
            message: message.into(),
        }
    }

    pub fn failure_type(&self) -> JobFailureType {
        match self {
            StepError::Typed { failure_type, .. } => *failure_type,
            StepError::Configuration(_) => JobFailureType::ConfigurationError,
            StepError::Process(e) => e.failure_type(),
            StepError::Io(e) => io_failure_type(e),
        }
    }
}

/// Maps an error chain to the failure type recorded on the job
///
/// The outermost error with a known type decides.
pub fn classify(error: &anyhow::Error) -> JobFailureType {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<StepError>() {
            return e.failure_type();
        }
        if let Some(e) = cause.downcast_ref::<ProcessError>() {
            return e.failure_type();
        }
        if cause.downcast_ref::<WorkflowError>().is_some() {
            return JobFailureType::ValidationError;
        }
        if cause.downcast_ref::<RegistryError>().is_some() {
            return JobFailureType::ConfigurationError;
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return match e {
                StoreError::WorkflowNotFound { .. } | StoreError::InvalidName(_) => {
                    JobFailureType::ConfigurationError
                }
                StoreError::Workflow(_) => JobFailureType::ValidationError,
                StoreError::Io(e) => io_failure_type(e),
                _ => JobFailureType::UnknownError,
            };
        }
        if let Some(e) = cause.downcast_ref::<io::Error>() {
            return io_failure_type(e);
        }
    }
    JobFailureType::UnknownError
}

fn io_failure_type(e: &io::Error) -> JobFailureType {
    match e.kind() {
        io::ErrorKind::NotFound => JobFailureType::FileNotFound,
        io::ErrorKind::OutOfMemory | io::ErrorKind::StorageFull => {
            JobFailureType::ResourceExhausted
        }
        _ => JobFailureType::UnknownError,
    }
}
