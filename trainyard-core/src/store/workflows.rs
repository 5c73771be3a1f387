//! Workflow definition store
//!
//! Workflows are human-editable YAML documents kept per scenario and loaded
//! by name when a job starts.

use std::io::ErrorKind;

use tokio::fs;
use tracing::{debug, info};

use super::StoreError;
use super::paths::{StorePaths, check_component};
use crate::domain::workflow::{Workflow, WorkflowError, is_valid_workflow_name};

pub struct WorkflowStore {
    paths: StorePaths,
}

impl WorkflowStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// Loads and parses a workflow by name
    pub async fn load(&self, scenario_id: &str, name: &str) -> Result<Workflow, StoreError> {
        check_component(scenario_id)?;
        if !is_valid_workflow_name(name) {
            return Err(WorkflowError::InvalidName(name.to_string()).into());
        }

        let path = self.paths.workflow_file(scenario_id, name);
        let source = match fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::WorkflowNotFound {
                    scenario_id: scenario_id.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        debug!("Loaded workflow '{}' from {}", name, path.display());
        Ok(Workflow::from_yaml(&source)?)
    }

    /// Validates and writes a workflow definition
    ///
    /// Only jobs started afterwards see the new definition.
    pub async fn save(&self, scenario_id: &str, workflow: &Workflow) -> Result<(), StoreError> {
        check_component(scenario_id)?;
        crate::graph::resolve(workflow)?;

        fs::create_dir_all(self.paths.workflows_dir(scenario_id)).await?;
        let path = self.paths.workflow_file(scenario_id, &workflow.name);
        fs::write(&path, workflow.to_yaml()?).await?;

        info!(
            "Workflow '{}' saved for scenario {}",
            workflow.name, scenario_id
        );
        Ok(())
    }

    /// Names of the workflows defined for a scenario, sorted
    pub async fn list(&self, scenario_id: &str) -> Result<Vec<String>, StoreError> {
        check_component(scenario_id)?;
        let mut entries = match fs::read_dir(self.paths.workflows_dir(scenario_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "yaml") {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                names.push(stem.to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobType;
    use crate::domain::workflow::WorkflowStep;
    use tempfile::TempDir;

    fn sample() -> Workflow {
        Workflow {
            name: "train_iris".to_string(),
            workflow_type: JobType::Train,
            environment: Default::default(),
            dataset_name: Some("iris.csv".to_string()),
            steps: vec![
                WorkflowStep::new("fetch", "dataset"),
                WorkflowStep::new("train", "train").depends_on("fetch"),
            ],
        }
    }

    #[tokio::test]
    async fn test_save_load_list() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(StorePaths::new(dir.path()));

        store.save("iris", &sample()).await.unwrap();
        let loaded = store.load("iris", "train_iris").await.unwrap();
        assert_eq!(loaded, sample());

        assert_eq!(store.list("iris").await.unwrap(), vec!["train_iris"]);
        assert!(store.list("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(StorePaths::new(dir.path()));
        assert!(matches!(
            store.load("iris", "nope").await,
            Err(StoreError::WorkflowNotFound { .. })
        ));
        assert!(matches!(
            store.load("iris", "../x").await,
            Err(StoreError::Workflow(WorkflowError::InvalidName(_)))
        ));
    }

    #[tokio::test]
    async fn test_save_rejects_cycle() {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::new(StorePaths::new(dir.path()));
        let mut wf = sample();
        wf.steps[0].dependencies.push("train".to_string());
        assert!(matches!(
            store.save("iris", &wf).await,
            Err(StoreError::Workflow(WorkflowError::Cycle(_)))
        ));
    }
}
