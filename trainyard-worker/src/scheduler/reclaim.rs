//! Stale job reclaim
//!
//! A worker that dies mid-job leaves its record `Running` forever. Every
//! poll cycle each worker looks for such jobs and fails them with
//! `WorkerCrash`. Only jobs this process is running right now are exempt;
//! a worker restarted under the same id reclaims what it left behind.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use trainyard_core::domain::job::{Job, JobStatus};
use trainyard_core::domain::log::{LogEntry, LogLevel};
use trainyard_core::store::{FileJobStore, StoreError};
use uuid::Uuid;

use crate::repository::DurableLogWriter;

/// Decides whether a running job has been abandoned
#[derive(Debug, Clone, Copy)]
pub struct StaleJobDetector {
    job_timeout: TimeDelta,
    idle_timeout: TimeDelta,
}

impl StaleJobDetector {
    pub fn new(job_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            job_timeout: TimeDelta::from_std(job_timeout).unwrap_or(TimeDelta::MAX),
            idle_timeout: TimeDelta::from_std(idle_timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    /// A job is stale when it has run longer than the job timeout and shown
    /// no activity (heartbeat or log write) for longer than the idle timeout
    pub fn is_stale(
        &self,
        job: &Job,
        log_modified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if job.status != JobStatus::Running {
            return false;
        }

        let started = job.started_at.unwrap_or(job.created_at);
        if now - started <= self.job_timeout {
            return false;
        }

        let last_activity = [job.last_heartbeat_at, log_modified]
            .into_iter()
            .flatten()
            .fold(started, |latest, t| latest.max(t));

        now - last_activity > self.idle_timeout
    }
}

/// Fails every stale job not in `running_here`; returns how many
pub async fn reclaim_stale_jobs(
    store: &FileJobStore,
    detector: &StaleJobDetector,
    running_here: &HashSet<Uuid>,
    worker_id: &str,
    log_writer: &DurableLogWriter,
) -> Result<usize> {
    let running = store
        .list(Some(JobStatus::Running))
        .await
        .context("Failed to list running jobs")?;

    let now = Utc::now();
    let mut reclaimed = 0;

    for job in running {
        let Some(owner) = job.worker_id.as_deref() else {
            continue;
        };
        if running_here.contains(&job.id) {
            continue;
        }

        let log_path = store.paths().job_log(&job.scenario_id, job.id);
        if !detector.is_stale(&job, modified_at(&log_path).await, now) {
            continue;
        }

        let message = format!("worker '{}' stopped responding", owner);
        match store
            .fail_stale(&job.scenario_id, job.id, owner, &message)
            .await
        {
            Ok(_) => {
                warn!("Reclaimed stale job {} from worker {}", job.id, owner);
                let line = LogEntry::new(
                    LogLevel::Error,
                    format!("Job failed (WorkerCrash): {}; reclaimed by {}", message, worker_id),
                )
                .to_line();
                if let Err(e) = log_writer.append_line(&log_path, &line).await {
                    warn!("Failed to append to log of job {}: {}", job.id, e);
                }
                reclaimed += 1;
            }
            Err(StoreError::Conflict { .. }) => {
                debug!("Job {} changed while reclaiming; leaving it", job.id);
            }
            Err(e) => warn!("Failed to reclaim job {}: {}", job.id, e),
        }
    }

    Ok(reclaimed)
}

async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trainyard_core::domain::failure::JobFailureType;
    use trainyard_core::domain::job::JobType;
    use trainyard_core::store::StorePaths;

    const HOUR: Duration = Duration::from_secs(3600);
    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn running_job(started_ago: TimeDelta, heartbeat_ago: TimeDelta) -> (Job, DateTime<Utc>) {
        let now = Utc::now();
        let mut job = Job::new("iris", JobType::Train, "train_iris");
        job.claim("ghost").unwrap();
        job.started_at = Some(now - started_ago);
        job.last_heartbeat_at = Some(now - heartbeat_ago);
        (job, now)
    }

    #[test]
    fn test_young_job_is_not_stale() {
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);
        let (job, now) = running_job(TimeDelta::minutes(30), TimeDelta::minutes(29));
        assert!(!detector.is_stale(&job, None, now));
    }

    #[test]
    fn test_old_idle_job_is_stale() {
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);
        let (job, now) = running_job(TimeDelta::hours(2), TimeDelta::minutes(30));
        assert!(detector.is_stale(&job, None, now));
    }

    #[test]
    fn test_recent_activity_keeps_job_alive() {
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);

        let (job, now) = running_job(TimeDelta::hours(2), TimeDelta::minutes(1));
        assert!(!detector.is_stale(&job, None, now));

        // Heartbeats stopped but the log is still growing
        let (job, now) = running_job(TimeDelta::hours(2), TimeDelta::hours(1));
        assert!(!detector.is_stale(&job, Some(now - TimeDelta::seconds(5)), now));
    }

    #[test]
    fn test_only_running_jobs_are_stale() {
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);
        let mut job = Job::new("iris", JobType::Train, "train_iris");
        job.created_at = Utc::now() - TimeDelta::days(3);
        assert!(!detector.is_stale(&job, None, Utc::now()));
    }

    async fn abandoned_job(store: &FileJobStore, owner: &str) -> Job {
        let job = Job::new("iris", JobType::Train, "train_iris");
        store.create(&job).await.unwrap();
        store.claim("iris", job.id, owner).await.unwrap();
        store
            .update("iris", job.id, |j| {
                j.started_at = Some(Utc::now() - TimeDelta::days(2));
                j.last_heartbeat_at = Some(Utc::now() - TimeDelta::days(1));
                Ok(())
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reclaim_fails_abandoned_job() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(StorePaths::new(dir.path()));
        let writer = DurableLogWriter::new();
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);

        let theirs = abandoned_job(&store, "ghost").await;
        let mine = abandoned_job(&store, "me").await;

        let running_here = HashSet::from([mine.id]);
        let reclaimed = reclaim_stale_jobs(&store, &detector, &running_here, "me", &writer)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let theirs = store.get("iris", theirs.id).await.unwrap();
        assert_eq!(theirs.status, JobStatus::Failed);
        assert_eq!(theirs.failure_type, JobFailureType::WorkerCrash);
        assert!(theirs.error_message.unwrap().contains("ghost"));

        let mine = store.get("iris", mine.id).await.unwrap();
        assert_eq!(mine.status, JobStatus::Running);

        let log = std::fs::read_to_string(store.paths().job_log("iris", theirs.id)).unwrap();
        assert!(log.contains("WorkerCrash"));
    }

    #[tokio::test]
    async fn test_restarted_worker_reclaims_its_own_orphan() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::new(StorePaths::new(dir.path()));
        let writer = DurableLogWriter::new();
        let detector = StaleJobDetector::new(HOUR, TEN_MINUTES);

        // Claimed before a crash; the restarted process runs nothing yet
        let orphan = abandoned_job(&store, "worker-a").await;

        let reclaimed =
            reclaim_stale_jobs(&store, &detector, &HashSet::new(), "worker-a", &writer)
                .await
                .unwrap();
        assert_eq!(reclaimed, 1);

        let orphan = store.get("iris", orphan.id).await.unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.failure_type, JobFailureType::WorkerCrash);
        assert!(orphan.worker_id.is_none());
    }
}
