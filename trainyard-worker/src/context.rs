//! Execution context for jobs
//!
//! Contains all state a step needs while it runs:
//! - The job and its workflow
//! - The base path every step works in
//! - The job log, written through the durable log writer
//! - The job's cancellation token

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trainyard_core::domain::job::Job;
use trainyard_core::domain::log::{LogEntry, LogLevel};
use trainyard_core::domain::workflow::Workflow;
use trainyard_core::store::StorePaths;

use crate::repository::DurableLogWriter;

/// Destination for job-facing log lines
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn log(&self, level: LogLevel, message: &str) -> io::Result<()>;
}

/// Execution context shared by the steps of one job
pub struct StepContext {
    pub job: Job,
    pub workflow: Workflow,
    base_path: PathBuf,
    log_path: PathBuf,
    log_writer: Arc<DurableLogWriter>,
    cancel: CancellationToken,
    paths: StorePaths,
}

impl StepContext {
    /// Creates a new execution context
    ///
    /// The base path is the job's `work/` directory inside the store.
    pub fn new(
        job: Job,
        workflow: Workflow,
        paths: StorePaths,
        log_writer: Arc<DurableLogWriter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let base_path = paths.job_work_dir(&job.scenario_id, job.id);
        let log_path = paths.job_log(&job.scenario_id, job.id);

        Arc::new(Self {
            job,
            workflow,
            base_path,
            log_path,
            log_writer,
            cancel,
            paths,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn scenario_datasets_dir(&self) -> PathBuf {
        self.paths.datasets_dir(&self.job.scenario_id)
    }

    /// The staged dataset a step should read by default
    ///
    /// `<base>/<dataset_name>` when the workflow names a dataset.
    pub fn dataset_path(&self) -> Option<PathBuf> {
        self.workflow
            .dataset_name
            .as_ref()
            .map(|name| self.base_path.join(name))
    }

    /// Values available to `${name}` placeholders
    ///
    /// Built-ins win over job variables, which win over the workflow
    /// environment.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self.workflow.environment.clone();

        for (key, value) in &self.job.variables {
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(key.clone(), rendered);
        }

        vars.insert("job_id".to_string(), self.job.id.to_string());
        vars.insert("scenario_id".to_string(), self.job.scenario_id.clone());
        if let Some(model_id) = &self.job.model_id {
            vars.insert("model_id".to_string(), model_id.clone());
        }
        vars.insert(
            "base_path".to_string(),
            self.base_path.to_string_lossy().into_owned(),
        );
        if let Some(dataset) = self.dataset_path() {
            vars.insert(
                "dataset_path".to_string(),
                dataset.to_string_lossy().into_owned(),
            );
        }

        vars
    }

    /// Appends an entry to the job log
    ///
    /// A failure after all retries is reported to the operator log only; a
    /// lost line never fails the step by itself.
    pub async fn add_log(&self, level: LogLevel, message: &str) {
        if let Err(e) = self.write_entry(level, message).await {
            warn!("Failed to append to log of job {}: {}", self.job.id, e);
        }
    }

    pub async fn log_info(&self, message: impl AsRef<str>) {
        self.add_log(LogLevel::Info, message.as_ref()).await;
    }

    pub async fn log_warning(&self, message: impl AsRef<str>) {
        self.add_log(LogLevel::Warning, message.as_ref()).await;
    }

    pub async fn log_error(&self, message: impl AsRef<str>) {
        self.add_log(LogLevel::Error, message.as_ref()).await;
    }

    async fn write_entry(&self, level: LogLevel, message: &str) -> io::Result<()> {
        debug!("[job {}] {}", self.job.id, message);
        let entry = LogEntry::new(level, message);
        self.log_writer
            .append_line(&self.log_path, &entry.to_line())
            .await
    }
}

#[async_trait]
impl LogSink for StepContext {
    async fn log(&self, level: LogLevel, message: &str) -> io::Result<()> {
        self.write_entry(level, message).await
    }
}

/// Everything a step runner receives besides its own definition
#[derive(Clone)]
pub struct StepRequest {
    pub base_path: PathBuf,
    /// Step deadline; `None` means the process runner default
    pub timeout: Option<Duration>,
    pub context: Arc<StepContext>,
}
