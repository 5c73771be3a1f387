//! Workflow graph resolution
//!
//! Turns the declared step dependencies into a sequential execution order.
//! An edge `A -> B` means B lists A in its dependencies. Among steps that are
//! ready at the same time, the one declared first runs first, so the same
//! definition always yields the same order.

use std::collections::{BTreeSet, HashMap};

use crate::domain::workflow::{Workflow, WorkflowError, WorkflowStep};

/// Validates the workflow and returns its steps in execution order
///
/// Fails on unknown dependencies and cycles without running anything.
pub fn resolve(workflow: &Workflow) -> Result<Vec<&WorkflowStep>, WorkflowError> {
    workflow.validate()?;

    let index_of: HashMap<&str, usize> = workflow
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| (step.name.as_str(), i))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); workflow.steps.len()];
    let mut in_degree: Vec<usize> = vec![0; workflow.steps.len()];

    for (i, step) in workflow.steps.iter().enumerate() {
        // Repeated entries in a dependency list count once
        let deps: BTreeSet<usize> = step
            .dependencies
            .iter()
            .filter_map(|d| index_of.get(d.as_str()).copied())
            .collect();
        for dep in deps {
            dependents[dep].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(workflow.steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(&workflow.steps[next]);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != workflow.steps.len() {
        let stuck = workflow
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, step)| step.name.clone())
            .collect();
        return Err(WorkflowError::Cycle(stuck));
    }

    Ok(order)
}
