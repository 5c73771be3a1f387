//! Job DTOs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::{Job, JobType};

/// Request to enqueue a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    pub scenario_id: String,
    pub job_type: JobType,
    pub workflow_name: String,
    pub model_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

impl From<CreateJob> for Job {
    fn from(req: CreateJob) -> Self {
        let mut job = Job::new(req.scenario_id, req.job_type, req.workflow_name);
        job.model_id = req.model_id;
        job.variables = req.variables;
        job
    }
}
