//! Job poller
//!
//! Scans the store for waiting jobs, claims them and executes them.
//! Each claimed job runs in its own task; a background loop keeps the
//! heartbeat of every owned job fresh so other workers do not reclaim it.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trainyard_core::domain::job::{Job, JobStatus};
use trainyard_core::domain::log::{LogEntry, LogLevel};
use trainyard_core::store::{FileJobStore, StoreError};
use uuid::Uuid;

use super::reclaim::{StaleJobDetector, reclaim_stale_jobs};
use crate::config::Config;
use crate::error::classify;
use crate::repository::DurableLogWriter;
use crate::service::ExecutionService;

/// Jobs this worker currently runs, with their scenario
type OwnedJobs = Arc<Mutex<HashMap<Uuid, String>>>;

/// Job poller that continuously polls for and executes jobs
pub struct JobPoller {
    config: Config,
    store: Arc<FileJobStore>,
    execution: Arc<dyn ExecutionService>,
    log_writer: Arc<DurableLogWriter>,
    semaphore: Arc<Semaphore>,
    owned: OwnedJobs,
    detector: StaleJobDetector,
}

impl JobPoller {
    /// Creates a new job poller
    pub fn new(
        config: Config,
        store: Arc<FileJobStore>,
        execution: Arc<dyn ExecutionService>,
        log_writer: Arc<DurableLogWriter>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_jobs));
        let detector = StaleJobDetector::new(config.job_timeout, config.idle_timeout);
        Self {
            config,
            store,
            execution,
            log_writer,
            semaphore,
            owned: Arc::new(Mutex::new(HashMap::new())),
            detector,
        }
    }

    /// Starts the polling loop
    ///
    /// Returns once `shutdown` is cancelled and every running job has
    /// finished.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Starting job poller (interval: {:?}, max parallel jobs: {})",
            self.config.poll_interval, self.config.max_parallel_jobs
        );

        // Outlives `shutdown` so jobs still winding down keep their heartbeat
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.start_heartbeat_loop(heartbeat_stop.clone());

        let mut tasks = JoinSet::new();
        let mut interval = time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    warn!("Job task panicked: {}", e);
                }
            }

            debug!("Polling for waiting jobs");

            match self.poll_once(&mut tasks, &shutdown).await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} job(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }

        if !tasks.is_empty() {
            info!("Shutting down; waiting for {} running job(s)", tasks.len());
        }
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                warn!("Job task panicked: {}", e);
            }
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task panicked: {}", e);
        }

        info!("Job poller stopped");
        Ok(())
    }

    /// Performs a single poll cycle: reclaim, then claim up to capacity
    async fn poll_once(
        &self,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<usize> {
        let running_here: HashSet<Uuid> = self.owned.lock().await.keys().copied().collect();
        match reclaim_stale_jobs(
            &self.store,
            &self.detector,
            &running_here,
            &self.config.worker_id,
            &self.log_writer,
        )
        .await
        {
            Ok(0) => {}
            Ok(n) => info!("Reclaimed {} stale job(s)", n),
            Err(e) => warn!("Stale job reclaim failed: {:#}", e),
        }

        let waiting = self
            .store
            .list(Some(JobStatus::Waiting))
            .await
            .context("Failed to list waiting jobs")?;

        if waiting.is_empty() {
            debug!("No jobs available");
            return Ok(0);
        }

        debug!("Found {} waiting job(s)", waiting.len());

        let mut started = 0;
        for job in waiting {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("Max parallel jobs reached, leaving job {} for later", job.id);
                break;
            };

            match self
                .store
                .claim(&job.scenario_id, job.id, &self.config.worker_id)
                .await
            {
                Ok(claimed) => {
                    info!(
                        "Claimed job {} ({} '{}', scenario {})",
                        claimed.id, claimed.job_type, claimed.workflow_name, claimed.scenario_id
                    );
                    self.spawn_job_task(tasks, claimed, permit, shutdown.child_token())
                        .await;
                    started += 1;
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("Job {} was claimed by another worker", job.id);
                }
                Err(e) => warn!("Failed to claim job {}: {}", job.id, e),
            }
        }

        Ok(started)
    }

    /// Spawns a task to execute a single claimed job
    async fn spawn_job_task(
        &self,
        tasks: &mut JoinSet<()>,
        job: Job,
        permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        self.owned
            .lock()
            .await
            .insert(job.id, job.scenario_id.clone());

        let store = Arc::clone(&self.store);
        let execution = Arc::clone(&self.execution);
        let log_writer = Arc::clone(&self.log_writer);
        let owned = Arc::clone(&self.owned);
        let worker_id = self.config.worker_id.clone();

        tasks.spawn(async move {
            let job_id = job.id;
            if let Err(e) =
                Self::execute_job(job, &worker_id, &store, execution, &log_writer, cancel).await
            {
                error!("Failed to finish job {}: {:#}", job_id, e);
            }
            owned.lock().await.remove(&job_id);
            // Permit is released here
            drop(permit);
        });
    }

    /// Runs one job and records its terminal state
    async fn execute_job(
        job: Job,
        worker_id: &str,
        store: &FileJobStore,
        execution: Arc<dyn ExecutionService>,
        log_writer: &DurableLogWriter,
        cancel: CancellationToken,
    ) -> Result<()> {
        let log_path = store.paths().job_log(&job.scenario_id, job.id);
        append_status(
            log_writer,
            &log_path,
            LogLevel::Info,
            &format!("Job claimed by worker {}", worker_id),
        )
        .await;

        match execution.execute_job(&job, cancel).await {
            Ok(()) => {
                store
                    .complete(&job.scenario_id, job.id, worker_id)
                    .await
                    .context("Failed to mark job completed")?;
                append_status(log_writer, &log_path, LogLevel::Info, "Job completed").await;
                info!("Job {} completed", job.id);
            }
            Err(e) => {
                let failure_type = classify(&e);
                let message = format!("{:#}", e);
                warn!("Job {} failed ({}): {}", job.id, failure_type, message);

                store
                    .fail(&job.scenario_id, job.id, worker_id, failure_type, &message)
                    .await
                    .context("Failed to mark job failed")?;
                append_status(
                    log_writer,
                    &log_path,
                    LogLevel::Error,
                    &format!("Job failed ({}): {}", failure_type, message),
                )
                .await;
            }
        }

        Ok(())
    }

    /// Starts a background task refreshing the heartbeat of owned jobs
    fn start_heartbeat_loop(&self, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let owned = Arc::clone(&self.owned);
        let worker_id = self.config.worker_id.clone();
        let heartbeat_interval: Duration = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(heartbeat_interval);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let jobs: Vec<(Uuid, String)> = owned
                    .lock()
                    .await
                    .iter()
                    .map(|(id, scenario)| (*id, scenario.clone()))
                    .collect();

                for (job_id, scenario_id) in jobs {
                    debug!("Sending heartbeat for job {}", job_id);
                    match store.heartbeat(&scenario_id, job_id, &worker_id).await {
                        Ok(_) => {}
                        // Finished between the snapshot and now
                        Err(StoreError::NotOwner { .. }) => {}
                        Err(e) => warn!("Failed to send heartbeat for job {}: {}", job_id, e),
                    }
                }
            }
        })
    }
}

async fn append_status(writer: &DurableLogWriter, path: &Path, level: LogLevel, message: &str) {
    let line = LogEntry::new(level, message).to_line();
    if let Err(e) = writer.append_line(path, &line).await {
        warn!("Failed to append to job log {}: {}", path.display(), e);
    }
}
