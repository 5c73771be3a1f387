//! `train` steps: drive the external ML tool to produce a model

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::workflow::WorkflowStep;

use super::StepRunner;
use super::args::{build_flags, keys_naming, optional_string, required_string};
use crate::context::StepRequest;
use crate::error::StepError;
use crate::process::ProcessRunner;

/// Keys the runner always sets itself
const RESERVED_KEYS: [&str; 3] = ["output", "log-file-path", "name"];
/// Keys consumed before the remaining ones become flags
const CONSUMED_KEYS: [&str; 3] = ["tool", "task", "dataset"];

const DEFAULT_TASK: &str = "classification";
const DEFAULT_MODEL_NAME: &str = "Model";

/// Invocation built from a step definition
#[derive(Debug)]
struct TrainInvocation {
    tool: String,
    argv: Vec<String>,
    output_dir: PathBuf,
}

/// Runs `<tool> <task> --dataset <path> --key value ...`
///
/// `--log-file-path`, `--output` and `--name` always point into the base
/// path; caller values for them are dropped.
pub struct TrainStepRunner {
    process: ProcessRunner,
    ml_tool_path: String,
}

impl TrainStepRunner {
    pub fn new(process: ProcessRunner, ml_tool_path: &str) -> Self {
        Self {
            process,
            ml_tool_path: ml_tool_path.to_string(),
        }
    }

    async fn build(
        &self,
        step: &WorkflowStep,
        request: &StepRequest,
    ) -> Result<TrainInvocation, StepError> {
        let ctx = &request.context;
        let vars = ctx.variables();
        let base = &request.base_path;

        let tool =
            optional_string(step, "tool", &vars)?.unwrap_or_else(|| self.ml_tool_path.clone());
        let task =
            optional_string(step, "task", &vars)?.unwrap_or_else(|| DEFAULT_TASK.to_string());

        let dataset = match optional_string(step, "dataset", &vars)? {
            Some(path) => base.join(path),
            None => ctx.dataset_path().ok_or_else(|| {
                StepError::Configuration(format!(
                    "step '{}' requires a 'dataset' or a workflow dataset_name",
                    step.name
                ))
            })?,
        };
        if !fs::try_exists(&dataset).await? {
            return Err(StepError::typed(
                JobFailureType::FileNotFound,
                format!("training dataset not found: {}", dataset.display()),
            ));
        }

        // Checked here so a missing label fails before the tool starts
        required_string(step, "label-col", &vars)?;

        for key in keys_naming(step, &RESERVED_KEYS) {
            ctx.log_warning(format!(
                "Ignoring '{}' in step '{}': it is set by the worker",
                key, step.name
            ))
            .await;
        }

        let skip: Vec<&str> = CONSUMED_KEYS
            .iter()
            .chain(RESERVED_KEYS.iter())
            .copied()
            .collect();
        let output_dir = base.join("model");
        let model_name = ctx
            .job
            .model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string());

        let mut argv = vec![task, "--dataset".to_string(), path_arg(&dataset)];
        argv.extend(build_flags(step, &vars, &skip)?);
        argv.extend([
            "--log-file-path".to_string(),
            path_arg(&base.join("train.log")),
            "--output".to_string(),
            path_arg(&output_dir),
            "--name".to_string(),
            model_name,
        ]);

        Ok(TrainInvocation {
            tool,
            argv,
            output_dir,
        })
    }
}

#[async_trait]
impl StepRunner for TrainStepRunner {
    fn step_type(&self) -> &'static str {
        "train"
    }

    async fn run(&self, step: &WorkflowStep, request: &StepRequest) -> Result<(), StepError> {
        let ctx = &request.context;
        let invocation = self.build(step, request).await?;

        ctx.log_info(format!(
            "Training: {} {}",
            invocation.tool,
            invocation.argv.join(" ")
        ))
        .await;

        let result = self
            .process
            .run_args(
                &invocation.tool,
                &invocation.argv,
                &request.base_path,
                request.timeout,
                ctx.cancel_token(),
                ctx.as_ref(),
            )
            .await?;

        if !result.success {
            let detail = result.standard_error.lines().last().unwrap_or("").trim();
            return Err(StepError::typed(
                JobFailureType::TrainingError,
                format!(
                    "training exited with code {}{}{}",
                    result.exit_code,
                    if detail.is_empty() { "" } else { ": " },
                    detail
                ),
            ));
        }

        if !has_artifacts(&invocation.output_dir).await? {
            return Err(StepError::typed(
                JobFailureType::TrainingError,
                format!(
                    "training finished but produced no model in {}",
                    invocation.output_dir.display()
                ),
            ));
        }

        ctx.log_info(format!(
            "Model written to {} in {:.1}s",
            invocation.output_dir.display(),
            result.processing_time.as_secs_f64()
        ))
        .await;
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn has_artifacts(dir: &Path) -> Result<bool, StepError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    Ok(entries.next_entry().await?.is_some())
}
