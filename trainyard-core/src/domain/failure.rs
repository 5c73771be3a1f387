//! Failure classification for jobs

use serde::{Deserialize, Serialize};

/// Why a job ended in `Failed`
///
/// `None` is the value carried by every job that has not failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobFailureType {
    #[default]
    None,
    Timeout,
    WorkerCrash,
    ValidationError,
    ProcessError,
    FileNotFound,
    ConfigurationError,
    UnknownError,
    ResourceExhausted,
    TrainingError,
    DataProcessingError,
}

impl std::fmt::Display for JobFailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobFailureType::None => "None",
            JobFailureType::Timeout => "Timeout",
            JobFailureType::WorkerCrash => "WorkerCrash",
            JobFailureType::ValidationError => "ValidationError",
            JobFailureType::ProcessError => "ProcessError",
            JobFailureType::FileNotFound => "FileNotFound",
            JobFailureType::ConfigurationError => "ConfigurationError",
            JobFailureType::UnknownError => "UnknownError",
            JobFailureType::ResourceExhausted => "ResourceExhausted",
            JobFailureType::TrainingError => "TrainingError",
            JobFailureType::DataProcessingError => "DataProcessingError",
        };
        write!(f, "{}", name)
    }
}
