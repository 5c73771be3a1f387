//! Workflow command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use std::path::Path;
use trainyard_core::domain::workflow::Workflow;
use trainyard_core::graph;

use crate::config::Config;

/// Workflow subcommands
#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Path to the YAML definition
        file: String,
    },
    /// Store a workflow definition for a scenario
    Add {
        /// Path to the YAML definition
        file: String,

        #[arg(short, long)]
        scenario: String,
    },
    /// List the workflows of a scenario
    List {
        #[arg(short, long)]
        scenario: String,
    },
    /// Show a stored workflow
    Show {
        /// Workflow name
        name: String,

        #[arg(short, long)]
        scenario: String,
    },
}

/// Routes workflow subcommands to their respective handlers
pub async fn handle_workflow_command(command: WorkflowCommands, config: &Config) -> Result<()> {
    match command {
        WorkflowCommands::Validate { file } => {
            let workflow = read_workflow(Path::new(&file)).await?;
            print_execution_order(&workflow)?;
            println!("{}", "✓ Workflow is valid".green().bold());
            Ok(())
        }
        WorkflowCommands::Add { file, scenario } => {
            let workflow = read_workflow(Path::new(&file)).await?;
            config
                .workflow_store()
                .save(&scenario, &workflow)
                .await
                .with_context(|| format!("Failed to save workflow '{}'", workflow.name))?;
            println!(
                "{}",
                format!(
                    "✓ Workflow '{}' saved for scenario {}",
                    workflow.name, scenario
                )
                .green()
                .bold()
            );
            Ok(())
        }
        WorkflowCommands::List { scenario } => {
            let names = config
                .workflow_store()
                .list(&scenario)
                .await
                .context("Failed to list workflows")?;

            if names.is_empty() {
                println!(
                    "{}",
                    format!("No workflows found for scenario {}.", scenario).yellow()
                );
            } else {
                println!(
                    "{}",
                    format!("Found {} workflow(s):", names.len()).bold()
                );
                for name in names {
                    println!("  {} {}", "▸".cyan(), name);
                }
            }
            Ok(())
        }
        WorkflowCommands::Show { name, scenario } => {
            let workflow = config
                .workflow_store()
                .load(&scenario, &name)
                .await
                .with_context(|| format!("Failed to load workflow '{}'", name))?;
            print_workflow(&workflow);
            print_execution_order(&workflow)
        }
    }
}

async fn read_workflow(path: &Path) -> Result<Workflow> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    Workflow::from_yaml(&source)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

fn print_workflow(workflow: &Workflow) {
    println!("{}", "Workflow Details:".bold());
    println!("  Name:    {}", workflow.name.cyan());
    println!("  Type:    {}", workflow.workflow_type);
    if let Some(dataset) = &workflow.dataset_name {
        println!("  Dataset: {}", dataset);
    }

    if !workflow.environment.is_empty() {
        println!("\n{}", "Environment:".bold());
        let mut keys: Vec<&String> = workflow.environment.keys().collect();
        keys.sort();
        for key in keys {
            println!("  {} = {}", key.cyan(), workflow.environment[key]);
        }
    }
    println!();
}

/// Resolves the step order, failing on an invalid graph
fn print_execution_order(workflow: &Workflow) -> Result<()> {
    let order = graph::resolve(workflow)
        .with_context(|| format!("Invalid workflow '{}'", workflow.name))?;

    println!("{}", "Execution order:".bold());
    for (i, step) in order.iter().enumerate() {
        let mut line = format!("  {}. {} ({})", i + 1, step.name.cyan(), step.step_type);
        if !step.dependencies.is_empty() {
            line.push_str(&format!(
                " after {}",
                step.dependencies.join(", ").dimmed()
            ));
        }
        println!("{}", line);
    }

    Ok(())
}
