//! On-disk layout of the scenario store
//!
//! ```text
//! <root>/scenarios/<scenario_id>/
//!     workflows/<name>.yaml
//!     datasets/<dataset_name>
//!     jobs/<job_id>/job.json
//!     jobs/<job_id>/job.lock
//!     jobs/<job_id>/job.log
//!     jobs/<job_id>/work/
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::StoreError;

#[derive(Debug, Clone)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scenarios_dir(&self) -> PathBuf {
        self.root.join("scenarios")
    }

    pub fn scenario_dir(&self, scenario_id: &str) -> PathBuf {
        self.scenarios_dir().join(scenario_id)
    }

    pub fn jobs_dir(&self, scenario_id: &str) -> PathBuf {
        self.scenario_dir(scenario_id).join("jobs")
    }

    pub fn job_dir(&self, scenario_id: &str, job_id: Uuid) -> PathBuf {
        self.jobs_dir(scenario_id).join(job_id.to_string())
    }

    pub fn job_record(&self, scenario_id: &str, job_id: Uuid) -> PathBuf {
        self.job_dir(scenario_id, job_id).join("job.json")
    }

    pub fn job_lock(&self, scenario_id: &str, job_id: Uuid) -> PathBuf {
        self.job_dir(scenario_id, job_id).join("job.lock")
    }

    pub fn job_log(&self, scenario_id: &str, job_id: Uuid) -> PathBuf {
        self.job_dir(scenario_id, job_id).join("job.log")
    }

    /// Working directory handed to every step of the job
    pub fn job_work_dir(&self, scenario_id: &str, job_id: Uuid) -> PathBuf {
        self.job_dir(scenario_id, job_id).join("work")
    }

    pub fn workflows_dir(&self, scenario_id: &str) -> PathBuf {
        self.scenario_dir(scenario_id).join("workflows")
    }

    pub fn workflow_file(&self, scenario_id: &str, name: &str) -> PathBuf {
        self.workflows_dir(scenario_id).join(format!("{}.yaml", name))
    }

    pub fn datasets_dir(&self, scenario_id: &str) -> PathBuf {
        self.scenario_dir(scenario_id).join("datasets")
    }

    pub fn dataset_file(&self, scenario_id: &str, dataset_name: &str) -> PathBuf {
        self.datasets_dir(scenario_id).join(dataset_name)
    }
}

/// Rejects ids that would escape the scenario directory
pub fn check_component(value: &str) -> Result<(), StoreError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.contains('\0');
    if bad {
        return Err(StoreError::InvalidName(value.to_string()));
    }
    Ok(())
}
