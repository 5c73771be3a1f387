//! Trainyard Worker
//!
//! A worker process that executes train and predict jobs from the shared
//! file store.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repository: Durable job log writes
//! - Steps: Runner registry and the built-in step runners
//! - Services: Workflow execution for a claimed job
//! - Scheduler: Job polling, heartbeats and stale job reclaim
//!
//! Any number of workers may share one store; the atomic claim in the store
//! decides which worker runs a job.

mod config;
mod context;
mod error;
mod process;
mod repository;
mod scheduler;
mod service;
mod steps;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trainyard_core::store::{FileJobStore, StorePaths};

use crate::config::Config;
use crate::process::ProcessRunner;
use crate::repository::DurableLogWriter;
use crate::scheduler::JobPoller;
use crate::service::{ExecutionService, StandardExecutionService};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trainyard_worker=info,trainyard_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Trainyard Worker");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, data_dir={}",
        config.worker_id,
        config.data_dir.display()
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let paths = StorePaths::new(&config.data_dir);
    let store = Arc::new(FileJobStore::new(paths.clone()));
    let log_writer = Arc::new(DurableLogWriter::new());

    // Initialize step runners
    let process = ProcessRunner::new(config.step_timeout);
    let registry = steps::builtin_registry(process, &config.ml_tool_path)
        .context("Failed to build step runner registry")?;

    let supported = registry.supported_types();
    info!("Registered {} step runner(s)", supported.len());
    for step_type in &supported {
        info!("  - {}", step_type);
    }

    let execution_service: Arc<dyn ExecutionService> = Arc::new(StandardExecutionService::new(
        Arc::new(registry),
        paths,
        Arc::clone(&log_writer),
    ));

    info!("Services initialized");

    let poller = JobPoller::new(config.clone(), store, execution_service, log_writer);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    info!("Worker initialized successfully");
    info!(
        "Poll interval: {:?}, heartbeat interval: {:?}",
        config.poll_interval, config.heartbeat_interval
    );

    if let Err(e) = poller.run(shutdown).await {
        error!("Poller error: {:#}", e);
        return Err(e);
    }

    info!("Worker stopped");
    Ok(())
}

/// Loads configuration from environment variables
///
/// Unset variables take their defaults; a malformed one stops the worker.
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Invalid worker configuration")?;
    config.validate()?;
    Ok(config)
}
