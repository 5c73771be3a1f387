//! Workflow domain types
//!
//! A workflow is a named pipeline of steps. Each step selects a runner by its
//! type and may depend on other steps of the same workflow.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

use super::job::JobType;

/// Workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(rename = "type")]
    pub workflow_type: JobType,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub dataset_name: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

/// A single step of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    /// Opaque to everything but the step's runner
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            configuration: HashMap::new(),
            dependencies: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.dependencies.push(step.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Workflow validation and resolution errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("invalid workflow name '{0}': must start with a letter and contain only letters, digits and '_'")]
    InvalidName(String),

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("step #{index} has an empty {field}")]
    EmptyStepField { index: usize, field: &'static str },

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("failed to parse workflow definition: {0}")]
    Parse(String),
}

/// Checks a workflow name against `^[A-Za-z][A-Za-z0-9_]*$`
pub fn is_valid_workflow_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

impl Workflow {
    /// Parses a YAML workflow definition
    pub fn from_yaml(source: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(source).map_err(|e| WorkflowError::Parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, WorkflowError> {
        serde_yaml::to_string(self).map_err(|e| WorkflowError::Parse(e.to_string()))
    }

    /// Structural validation: name, steps, uniqueness, dependency references
    ///
    /// Cycles are detected by [`crate::graph::resolve`].
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !is_valid_workflow_name(&self.name) {
            return Err(WorkflowError::InvalidName(self.name.clone()));
        }

        if self.steps.is_empty() {
            return Err(WorkflowError::NoSteps(self.name.clone()));
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(WorkflowError::EmptyStepField {
                    index,
                    field: "name",
                });
            }
            if step.step_type.trim().is_empty() {
                return Err(WorkflowError::EmptyStepField {
                    index,
                    field: "type",
                });
            }
            if !names.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
        }

        for step in &self.steps {
            for dependency in &step.dependencies {
                if dependency == &step.name {
                    return Err(WorkflowError::Cycle(vec![step.name.clone()]));
                }
                if !names.contains(dependency.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            name: "train_default".to_string(),
            workflow_type: JobType::Train,
            environment: HashMap::new(),
            dataset_name: None,
            steps,
        }
    }

    #[test]
    fn test_workflow_names() {
        assert!(is_valid_workflow_name("train"));
        assert!(is_valid_workflow_name("Train_v2"));
        assert!(!is_valid_workflow_name(""));
        assert!(!is_valid_workflow_name("2train"));
        assert!(!is_valid_workflow_name("_train"));
        assert!(!is_valid_workflow_name("train-v2"));
    }

    #[test]
    fn test_validate_ok() {
        let wf = workflow(vec![
            WorkflowStep::new("fetch", "dataset"),
            WorkflowStep::new("train", "train").depends_on("fetch"),
        ]);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_and_bad_name() {
        assert!(matches!(
            workflow(vec![]).validate(),
            Err(WorkflowError::NoSteps(_))
        ));

        let mut wf = workflow(vec![WorkflowStep::new("a", "command")]);
        wf.name = "bad name".to_string();
        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidName(_))));
    }

    #[test]
    fn test_validate_rejects_empty_type_and_duplicates() {
        let wf = workflow(vec![WorkflowStep::new("a", "")]);
        assert_eq!(
            wf.validate(),
            Err(WorkflowError::EmptyStepField {
                index: 0,
                field: "type"
            })
        );

        let wf = workflow(vec![
            WorkflowStep::new("a", "command"),
            WorkflowStep::new("a", "command"),
        ]);
        assert_eq!(
            wf.validate(),
            Err(WorkflowError::DuplicateStep("a".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let wf = workflow(vec![WorkflowStep::new("train", "train").depends_on("fetch")]);
        assert_eq!(
            wf.validate(),
            Err(WorkflowError::UnknownDependency {
                step: "train".to_string(),
                dependency: "fetch".to_string()
            })
        );
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
name: train_iris
type: Train
dataset_name: iris.csv
environment:
  LABEL: species
steps:
  - name: fetch
    type: dataset
  - name: train
    type: train
    dependencies: [fetch]
    timeout_ms: 60000
    configuration:
      task: classification
      label-col: ${LABEL}
"#;
        let wf = Workflow::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "train_iris");
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].dependencies, vec!["fetch".to_string()]);
        assert_eq!(wf.steps[1].timeout(), Some(Duration::from_secs(60)));
        assert_eq!(
            wf.steps[1].configuration["label-col"],
            serde_json::json!("${LABEL}")
        );
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_invalid() {
        assert!(matches!(
            Workflow::from_yaml("name: [unclosed"),
            Err(WorkflowError::Parse(_))
        ));
    }
}
