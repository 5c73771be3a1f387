//! `predict` steps: score an input file with a trained model

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::workflow::WorkflowStep;

use super::StepRunner;
use super::args::{build_flags, keys_naming, optional_string};
use crate::context::StepRequest;
use crate::error::StepError;
use crate::process::ProcessRunner;

const CONSUMED_KEYS: [&str; 5] = ["tool", "command", "model", "input", "output"];
const PREDICTIONS_FILE: &str = "predictions.csv";

/// Runs `<tool> <command> --model <dir> --input <file> ... --output <base>/predictions.csv`
///
/// `model` defaults to the model trained under the base path and `input` to
/// the staged dataset.
pub struct PredictStepRunner {
    process: ProcessRunner,
    ml_tool_path: String,
}

impl PredictStepRunner {
    pub fn new(process: ProcessRunner, ml_tool_path: &str) -> Self {
        Self {
            process,
            ml_tool_path: ml_tool_path.to_string(),
        }
    }
}

#[async_trait]
impl StepRunner for PredictStepRunner {
    fn step_type(&self) -> &'static str {
        "predict"
    }

    async fn run(&self, step: &WorkflowStep, request: &StepRequest) -> Result<(), StepError> {
        let ctx = &request.context;
        let vars = ctx.variables();
        let base = &request.base_path;

        let tool = optional_string(step, "tool", &vars)?
            .unwrap_or_else(|| self.ml_tool_path.clone());
        let command =
            optional_string(step, "command", &vars)?.unwrap_or_else(|| "predict".to_string());

        let model: PathBuf = optional_string(step, "model", &vars)?
            .map(|m| base.join(m))
            .unwrap_or_else(|| base.join("model"));
        let input: PathBuf = match optional_string(step, "input", &vars)? {
            Some(input) => base.join(input),
            None => ctx.dataset_path().ok_or_else(|| {
                StepError::Configuration(format!(
                    "step '{}' requires an 'input' or a workflow dataset_name",
                    step.name
                ))
            })?,
        };

        for (what, path) in [("model", &model), ("input", &input)] {
            if !fs::try_exists(path).await? {
                return Err(StepError::typed(
                    JobFailureType::FileNotFound,
                    format!("prediction {} not found: {}", what, path.display()),
                ));
            }
        }

        for key in keys_naming(step, &["output"]) {
            ctx.log_warning(format!(
                "Ignoring '{}' in step '{}': predictions go to {}",
                key, step.name, PREDICTIONS_FILE
            ))
            .await;
        }

        let output = base.join(PREDICTIONS_FILE);
        // A stale file from an earlier attempt must not pass for fresh output
        match fs::remove_file(&output).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut argv = vec![
            command,
            "--model".to_string(),
            model.to_string_lossy().into_owned(),
            "--input".to_string(),
            input.to_string_lossy().into_owned(),
        ];
        argv.extend(build_flags(step, &vars, &CONSUMED_KEYS)?);
        argv.extend(["--output".to_string(), output.to_string_lossy().into_owned()]);

        ctx.log_info(format!("Predicting: {} {}", tool, argv.join(" ")))
            .await;

        let result = self
            .process
            .run_args(
                &tool,
                &argv,
                base,
                request.timeout,
                ctx.cancel_token(),
                ctx.as_ref(),
            )
            .await?;

        if !result.success {
            return Err(StepError::typed(
                JobFailureType::DataProcessingError,
                format!("prediction exited with code {}", result.exit_code),
            ));
        }

        if !fs::try_exists(&output).await? {
            return Err(StepError::typed(
                JobFailureType::DataProcessingError,
                format!("prediction produced no output at {}", output.display()),
            ));
        }

        ctx.log_info(format!("Predictions written to {}", output.display()))
            .await;
        Ok(())
    }
}
