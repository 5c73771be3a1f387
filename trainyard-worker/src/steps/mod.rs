//! Step runners
//!
//! Every workflow step names a type; the registry maps that type to the
//! runner that executes it. The registry is built once at startup and is
//! read-only afterwards.

mod args;
mod command;
mod dataset;
mod predict;
mod train;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use trainyard_core::domain::workflow::WorkflowStep;

use crate::context::StepRequest;
use crate::error::StepError;

pub use command::CommandStepRunner;
pub use dataset::DatasetStepRunner;
pub use predict::PredictStepRunner;
pub use train::TrainStepRunner;

/// Executes steps of one type
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Step type this runner handles, matched case-insensitively
    fn step_type(&self) -> &'static str;

    async fn run(&self, step: &WorkflowStep, request: &StepRequest) -> Result<(), StepError>;
}

/// Registry error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("more than one runner registered for step type '{0}'")]
    Duplicate(String),

    #[error("no runner registered for step type '{0}'")]
    NotFound(String),
}

/// Step type to runner map
pub struct StepRunnerRegistry {
    runners: HashMap<String, Arc<dyn StepRunner>>,
}

impl StepRunnerRegistry {
    pub fn new(runners: Vec<Arc<dyn StepRunner>>) -> Result<Self, RegistryError> {
        let mut map = HashMap::with_capacity(runners.len());
        for runner in runners {
            let key = runner.step_type().to_ascii_lowercase();
            if map.contains_key(&key) {
                return Err(RegistryError::Duplicate(key));
            }
            map.insert(key, runner);
        }
        Ok(Self { runners: map })
    }

    pub fn get_runner(&self, step_type: &str) -> Result<Arc<dyn StepRunner>, RegistryError> {
        self.runners
            .get(&step_type.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(step_type.to_string()))
    }

    pub fn has_runner(&self, step_type: &str) -> bool {
        self.runners.contains_key(&step_type.to_ascii_lowercase())
    }

    /// Registered step types, sorted
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Registry with the built-in runners
pub fn builtin_registry(
    process: crate::process::ProcessRunner,
    ml_tool_path: &str,
) -> Result<StepRunnerRegistry, RegistryError> {
    StepRunnerRegistry::new(vec![
        Arc::new(CommandStepRunner::new(process.clone())),
        Arc::new(DatasetStepRunner::new()),
        Arc::new(TrainStepRunner::new(process.clone(), ml_tool_path)),
        Arc::new(PredictStepRunner::new(process, ml_tool_path)),
    ])
}
