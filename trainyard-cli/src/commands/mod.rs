//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod workflow;

pub use job::JobCommands;
pub use workflow::WorkflowCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Workflow definitions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Workflow { command } => {
            workflow::handle_workflow_command(command, config).await
        }
    }
}
