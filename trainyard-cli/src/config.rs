//! CLI configuration

use std::path::PathBuf;

use trainyard_core::store::{FileJobStore, StorePaths, WorkflowStore};

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the store shared with the workers
    pub data_dir: PathBuf,
}

impl Config {
    pub fn paths(&self) -> StorePaths {
        StorePaths::new(&self.data_dir)
    }

    pub fn job_store(&self) -> FileJobStore {
        FileJobStore::new(self.paths())
    }

    pub fn workflow_store(&self) -> WorkflowStore {
        WorkflowStore::new(self.paths())
    }
}
