//! `command` steps: run an arbitrary executable

use async_trait::async_trait;
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::workflow::WorkflowStep;

use super::StepRunner;
use super::args::{bool_flag, optional_string, required_string};
use crate::context::StepRequest;
use crate::error::StepError;
use crate::process::ProcessRunner;

/// Runs `configuration.command` with `configuration.arguments`
///
/// Keys:
/// - `command` (required)
/// - `arguments`: single argument string, split like a command line
/// - `working_directory`: relative to the base path; defaults to it
/// - `allow_failure`: a non-zero exit does not fail the step
pub struct CommandStepRunner {
    process: ProcessRunner,
}

impl CommandStepRunner {
    pub fn new(process: ProcessRunner) -> Self {
        Self { process }
    }
}

#[async_trait]
impl StepRunner for CommandStepRunner {
    fn step_type(&self) -> &'static str {
        "command"
    }

    async fn run(&self, step: &WorkflowStep, request: &StepRequest) -> Result<(), StepError> {
        let ctx = &request.context;
        let vars = ctx.variables();

        let command = required_string(step, "command", &vars)?;
        let arguments = optional_string(step, "arguments", &vars)?.unwrap_or_default();
        let allow_failure = bool_flag(step, "allow_failure")?;
        let working_dir = match optional_string(step, "working_directory", &vars)? {
            Some(dir) => request.base_path.join(dir),
            None => request.base_path.clone(),
        };

        ctx.log_info(format!("Running: {} {}", command, arguments))
            .await;

        let result = self
            .process
            .run(
                &command,
                &arguments,
                &working_dir,
                request.timeout,
                ctx.cancel_token(),
                ctx.as_ref(),
            )
            .await?;

        if result.success {
            return Ok(());
        }

        if allow_failure {
            ctx.log_warning(format!(
                "'{}' exited with code {}; continuing (allow_failure)",
                command, result.exit_code
            ))
            .await;
            return Ok(());
        }

        Err(StepError::typed(
            JobFailureType::ProcessError,
            format!("'{}' exited with code {}", command, result.exit_code),
        ))
    }
}
