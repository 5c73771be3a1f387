//! `dataset` steps: stage a dataset into the job's base path

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::workflow::WorkflowStep;

use super::StepRunner;
use super::args::optional_string;
use crate::context::StepRequest;
use crate::error::StepError;

/// Copies a dataset file into the base path
///
/// The source is `configuration.source` (relative paths resolve against
/// the scenario's datasets directory) or else the workflow's
/// `dataset_name`. `configuration.target` renames the staged copy.
pub struct DatasetStepRunner;

impl DatasetStepRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DatasetStepRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for DatasetStepRunner {
    fn step_type(&self) -> &'static str {
        "dataset"
    }

    async fn run(&self, step: &WorkflowStep, request: &StepRequest) -> Result<(), StepError> {
        let ctx = &request.context;
        let vars = ctx.variables();
        let datasets_dir = ctx.scenario_datasets_dir();

        let source: PathBuf = match optional_string(step, "source", &vars)? {
            Some(source) => datasets_dir.join(source),
            None => match &ctx.workflow.dataset_name {
                Some(name) => datasets_dir.join(name),
                None => {
                    return Err(StepError::Configuration(format!(
                        "step '{}' needs a 'source' or a workflow dataset_name",
                        step.name
                    )));
                }
            },
        };

        if !fs::try_exists(&source).await? {
            return Err(StepError::typed(
                JobFailureType::FileNotFound,
                format!("dataset not found: {}", source.display()),
            ));
        }

        let target = match optional_string(step, "target", &vars)? {
            Some(target) => request.base_path.join(target),
            None => match (&ctx.workflow.dataset_name, source.file_name()) {
                (Some(name), _) => request.base_path.join(name),
                (None, Some(file_name)) => request.base_path.join(file_name),
                (None, None) => {
                    return Err(StepError::Configuration(format!(
                        "cannot derive a target name from '{}'",
                        source.display()
                    )));
                }
            },
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = fs::copy(&source, &target).await?;

        ctx.log_info(format!(
            "Staged dataset {} -> {} ({} bytes)",
            source.display(),
            target.display(),
            bytes
        ))
        .await;

        Ok(())
    }
}
