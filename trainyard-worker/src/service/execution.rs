//! Execution service
//!
//! Handles workflow job execution including:
//! - Loading the job's workflow and checking it matches the job
//! - Resolving the step order before anything runs
//! - Running steps one by one through the runner registry
//!
//! The first failing step aborts the job; its error is returned with the
//! step name as context so the scheduler can classify and record it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::job::Job;
use trainyard_core::domain::log::LogLevel;
use trainyard_core::graph;
use trainyard_core::store::{StorePaths, WorkflowStore};

use crate::context::{StepContext, StepRequest};
use crate::error::StepError;
use crate::repository::DurableLogWriter;
use crate::steps::StepRunnerRegistry;

/// Service trait for executing jobs
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Runs every step of the job's workflow
    ///
    /// `cancel` is triggered when the worker shuts down; the running step's
    /// process is killed and no further step starts.
    async fn execute_job(&self, job: &Job, cancel: CancellationToken) -> Result<()>;
}

/// Standard implementation of ExecutionService
pub struct StandardExecutionService {
    registry: Arc<StepRunnerRegistry>,
    workflows: WorkflowStore,
    log_writer: Arc<DurableLogWriter>,
    paths: StorePaths,
}

impl StandardExecutionService {
    pub fn new(
        registry: Arc<StepRunnerRegistry>,
        paths: StorePaths,
        log_writer: Arc<DurableLogWriter>,
    ) -> Self {
        Self {
            registry,
            workflows: WorkflowStore::new(paths.clone()),
            log_writer,
            paths,
        }
    }
}

#[async_trait]
impl ExecutionService for StandardExecutionService {
    async fn execute_job(&self, job: &Job, cancel: CancellationToken) -> Result<()> {
        let workflow = self
            .workflows
            .load(&job.scenario_id, &job.workflow_name)
            .await
            .with_context(|| format!("Failed to load workflow '{}'", job.workflow_name))?;

        info!(
            "Starting execution of job {} - workflow '{}'",
            job.id, workflow.name
        );

        let ctx = StepContext::new(
            job.clone(),
            workflow,
            self.paths.clone(),
            Arc::clone(&self.log_writer),
            cancel.clone(),
        );
        ctx.log_info(format!("Starting workflow: {}", ctx.workflow.name))
            .await;

        if ctx.workflow.workflow_type != job.job_type {
            let err = StepError::Configuration(format!(
                "workflow '{}' is a {} workflow but job {} is a {} job",
                ctx.workflow.name, ctx.workflow.workflow_type, job.id, job.job_type
            ));
            ctx.log_error(err.to_string()).await;
            return Err(err.into());
        }

        let order = match graph::resolve(&ctx.workflow) {
            Ok(order) => order,
            Err(e) => {
                ctx.log_error(format!("Invalid workflow: {}", e)).await;
                return Err(anyhow::Error::from(e).context("Invalid workflow"));
            }
        };

        let names: Vec<&str> = order.iter().map(|s| s.name.as_str()).collect();
        ctx.add_log(
            LogLevel::Debug,
            &format!("Execution order: {}", names.join(" -> ")),
        )
        .await;

        // Every step needs a runner before the first one starts
        let mut plan = Vec::with_capacity(order.len());
        for step in order {
            match self.registry.get_runner(&step.step_type) {
                Ok(runner) => plan.push((step, runner)),
                Err(e) => {
                    ctx.log_error(format!("Step '{}': {}", step.name, e)).await;
                    return Err(anyhow::Error::from(e)
                        .context(format!("Step '{}' cannot run", step.name)));
                }
            }
        }

        tokio::fs::create_dir_all(ctx.base_path())
            .await
            .with_context(|| format!("Failed to create {}", ctx.base_path().display()))?;

        let total = plan.len();
        for (idx, (step, runner)) in plan.into_iter().enumerate() {
            if cancel.is_cancelled() {
                ctx.log_warning("Worker shutting down; remaining steps skipped")
                    .await;
                return Err(StepError::typed(JobFailureType::WorkerCrash, "worker shut down").into());
            }

            info!(
                "Executing step {}/{}: {} ({})",
                idx + 1,
                total,
                step.name,
                step.step_type
            );
            ctx.log_info(format!("Starting step: {}", step.name)).await;

            let request = StepRequest {
                base_path: ctx.base_path().to_path_buf(),
                timeout: step.timeout(),
                context: Arc::clone(&ctx),
            };

            if let Err(e) = runner.run(step, &request).await {
                ctx.log_error(format!("Step '{}' failed: {}", step.name, e))
                    .await;
                return Err(anyhow::Error::from(e).context(format!("Step '{}' failed", step.name)));
            }

            debug!("Step '{}' completed successfully", step.name);
            ctx.log_info(format!("Step '{}' completed", step.name)).await;
        }

        info!("Job {} completed successfully", job.id);
        ctx.log_info("Workflow completed successfully").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::process::ProcessRunner;
    use crate::steps::{CommandStepRunner, DatasetStepRunner, StepRunner};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use trainyard_core::domain::job::JobType;
    use trainyard_core::domain::workflow::{Workflow, WorkflowStep};

    /// Records which steps ran, under a configurable type
    struct RecordingRunner {
        step_type: &'static str,
        ran: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StepRunner for RecordingRunner {
        fn step_type(&self) -> &'static str {
            self.step_type
        }

        async fn run(&self, step: &WorkflowStep, _request: &StepRequest) -> Result<(), StepError> {
            self.ran.lock().unwrap().push(step.name.clone());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        paths: StorePaths,
        service: StandardExecutionService,
        ran: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ran = Arc::new(Mutex::new(Vec::new()));

        let registry = StepRunnerRegistry::new(vec![
            Arc::new(RecordingRunner {
                step_type: "train",
                ran: Arc::clone(&ran),
            }),
            Arc::new(RecordingRunner {
                step_type: "noop",
                ran: Arc::clone(&ran),
            }),
            Arc::new(DatasetStepRunner::new()),
            Arc::new(CommandStepRunner::new(ProcessRunner::default())),
        ])
        .unwrap();

        let service = StandardExecutionService::new(
            Arc::new(registry),
            paths.clone(),
            Arc::new(DurableLogWriter::new()),
        );

        Fixture {
            _dir: dir,
            paths,
            service,
            ran,
        }
    }

    fn workflow(name: &str, steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            name: name.to_string(),
            workflow_type: JobType::Train,
            environment: Default::default(),
            dataset_name: Some("iris.csv".to_string()),
            steps,
        }
    }

    async fn save(fx: &Fixture, wf: &Workflow) {
        WorkflowStore::new(fx.paths.clone())
            .save("iris", wf)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_steps_run_in_declared_order() {
        let fx = fixture();
        save(
            &fx,
            &workflow(
                "pair",
                vec![WorkflowStep::new("a", "noop"), WorkflowStep::new("b", "noop")],
            ),
        )
        .await;

        let job = Job::new("iris", JobType::Train, "pair");
        fx.service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*fx.ran.lock().unwrap(), vec!["a", "b"]);
        let log = std::fs::read_to_string(fx.paths.job_log("iris", job.id)).unwrap();
        assert!(log.contains("[DEBUG] Execution order: a -> b"));
        assert!(log.contains("Workflow completed successfully"));
    }

    #[tokio::test]
    async fn test_missing_dataset_stops_before_train() {
        let fx = fixture();
        save(
            &fx,
            &workflow(
                "train_iris",
                vec![
                    WorkflowStep::new("train", "train").depends_on("fetch"),
                    WorkflowStep::new("fetch", "dataset"),
                ],
            ),
        )
        .await;

        let job = Job::new("iris", JobType::Train, "train_iris");
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(classify(&err), JobFailureType::FileNotFound);
        assert!(format!("{:#}", err).starts_with("Step 'fetch' failed"));
        assert!(fx.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_runs_nothing() {
        let fx = fixture();
        // Written by hand: the workflow store refuses to save a cycle
        let path = fx.paths.workflow_file("iris", "looped");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
name: looped
type: Train
steps:
  - name: a
    type: noop
    dependencies: [b]
  - name: b
    type: noop
    dependencies: [a]
"#,
        )
        .unwrap();

        let job = Job::new("iris", JobType::Train, "looped");
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(classify(&err), JobFailureType::ValidationError);
        assert!(fx.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_step_type_runs_nothing() {
        let fx = fixture();
        save(
            &fx,
            &workflow(
                "mystery",
                vec![
                    WorkflowStep::new("a", "noop"),
                    WorkflowStep::new("b", "evaluate"),
                ],
            ),
        )
        .await;

        let job = Job::new("iris", JobType::Train, "mystery");
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(classify(&err), JobFailureType::ConfigurationError);
        assert!(fx.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_workflow_and_type_mismatch() {
        let fx = fixture();
        let job = Job::new("iris", JobType::Train, "absent");
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(classify(&err), JobFailureType::ConfigurationError);

        save(&fx, &workflow("pair", vec![WorkflowStep::new("a", "noop")])).await;
        let job = Job::new("iris", JobType::Predict, "pair");
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(classify(&err), JobFailureType::ConfigurationError);
        assert!(fx.ran.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_step_timeout() {
        let fx = fixture();
        let mut slow = WorkflowStep::new("slow", "command")
            .with_config("command", json!("sleep"))
            .with_config("arguments", json!("10"));
        slow.timeout_ms = Some(100);
        save(
            &fx,
            &workflow("slow", vec![slow, WorkflowStep::new("after", "noop").depends_on("slow")]),
        )
        .await;

        let job = Job::new("iris", JobType::Train, "slow");
        let started = std::time::Instant::now();
        let err = fx
            .service
            .execute_job(&job, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(classify(&err), JobFailureType::Timeout);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(fx.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let fx = fixture();
        save(&fx, &workflow("pair", vec![WorkflowStep::new("a", "noop")])).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = Job::new("iris", JobType::Train, "pair");
        let err = fx.service.execute_job(&job, cancel).await.unwrap_err();

        assert_eq!(classify(&err), JobFailureType::WorkerCrash);
        assert!(fx.ran.lock().unwrap().is_empty());
    }
}
