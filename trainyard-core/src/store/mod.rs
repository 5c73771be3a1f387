//! Scenario-scoped file store
//!
//! Durable state shared by the enqueuer and every worker: job records and
//! workflow definitions. The store is the only concurrency-control point
//! between workers; see [`FileJobStore`] for the claim protocol.

mod jobs;
pub mod paths;
mod workflows;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::job::TransitionError;
use crate::domain::workflow::WorkflowError;

pub use jobs::FileJobStore;
pub use paths::StorePaths;
pub use workflows::WorkflowStore;

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job {0} already exists")]
    JobExists(Uuid),

    #[error("workflow '{name}' not found in scenario '{scenario_id}'")]
    WorkflowNotFound { scenario_id: String, name: String },

    #[error("job {job_id} cannot be updated: {reason}")]
    Conflict { job_id: Uuid, reason: String },

    #[error("worker '{worker_id}' does not own job {job_id}")]
    NotOwner { job_id: Uuid, worker_id: String },

    #[error("invalid path component '{0}'")]
    InvalidName(String),

    #[error("timed out waiting for the lock on job {0}")]
    LockTimeout(Uuid),

    #[error("corrupt job record {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}
