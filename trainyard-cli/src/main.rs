//! Trainyard CLI
//!
//! Command-line interface for enqueuing jobs and inspecting the shared
//! file store that workers poll.

mod commands;
mod config;
mod id_resolver;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "trainyard")]
#[command(about = "Trainyard ML job CLI", long_about = None)]
struct Cli {
    /// Root directory of the shared store
    #[arg(long, env = "TRAINYARD_DATA_DIR", default_value = "./data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        data_dir: cli.data_dir.into(),
    };

    handle_command(cli.command, &config).await
}
