//! File-backed job store
//!
//! One JSON record per job. Every mutation is a compare-and-swap:
//! - an in-process mutex serializes updates from this process
//! - an exclusive lock file (`create_new`) serializes updates across processes
//! - the record is re-read under the lock, checked, and replaced by an
//!   atomic rename so readers never observe a half-written record

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StoreError;
use super::paths::{StorePaths, check_component};
use crate::domain::failure::JobFailureType;
use crate::domain::job::{Job, JobStatus};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(60);

/// Job records stored under the scenario directories
pub struct FileJobStore {
    paths: StorePaths,
    local: Mutex<()>,
    lock_wait: Duration,
    lock_stale_after: Duration,
}

impl FileJobStore {
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            local: Mutex::new(()),
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Persists a new job record; fails if the job already exists
    pub async fn create(&self, job: &Job) -> Result<(), StoreError> {
        check_component(&job.scenario_id)?;
        let dir = self.paths.job_dir(&job.scenario_id, job.id);
        fs::create_dir_all(&dir).await?;

        let record = self.paths.job_record(&job.scenario_id, job.id);
        if fs::try_exists(&record).await? {
            return Err(StoreError::JobExists(job.id));
        }

        write_atomic(&record, job).await?;
        info!("Job created: {} (scenario {})", job.id, job.scenario_id);
        Ok(())
    }

    /// Reads a job record
    pub async fn get(&self, scenario_id: &str, job_id: Uuid) -> Result<Job, StoreError> {
        check_component(scenario_id)?;
        read_record(&self.paths.job_record(scenario_id, job_id), job_id).await
    }

    /// Locates a job by id across all scenarios
    pub async fn find(&self, job_id: Uuid) -> Result<Job, StoreError> {
        for scenario_id in self.scenario_ids().await? {
            let record = self.paths.job_record(&scenario_id, job_id);
            if fs::try_exists(&record).await? {
                return read_record(&record, job_id).await;
            }
        }
        Err(StoreError::JobNotFound(job_id))
    }

    /// Lists jobs of every scenario, oldest first
    ///
    /// Records that cannot be parsed are skipped with a warning so one bad
    /// file does not stall every worker.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for scenario_id in self.scenario_ids().await? {
            jobs.extend(self.list_scenario_unsorted(&scenario_id, status).await?);
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Lists jobs of one scenario, oldest first
    pub async fn list_scenario(
        &self,
        scenario_id: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        check_component(scenario_id)?;
        let mut jobs = self.list_scenario_unsorted(scenario_id, status).await?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    /// Atomically moves a waiting job to `Running` under `worker_id`
    ///
    /// Exactly one of several concurrent claimers succeeds; the others get
    /// [`StoreError::Conflict`].
    pub async fn claim(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Job, StoreError> {
        self.update(scenario_id, job_id, |job| {
            if job.status != JobStatus::Waiting {
                return Err(StoreError::Conflict {
                    job_id,
                    reason: format!("job is {}", job.status),
                });
            }
            job.claim(worker_id)?;
            Ok(())
        })
        .await
    }

    pub async fn complete(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Job, StoreError> {
        self.update(scenario_id, job_id, |job| {
            ensure_owner(job, worker_id)?;
            job.complete()?;
            Ok(())
        })
        .await
    }

    pub async fn fail(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        worker_id: &str,
        failure_type: JobFailureType,
        message: &str,
    ) -> Result<Job, StoreError> {
        self.update(scenario_id, job_id, |job| {
            ensure_owner(job, worker_id)?;
            job.fail(failure_type, message)?;
            Ok(())
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Job, StoreError> {
        self.update(scenario_id, job_id, |job| {
            ensure_owner(job, worker_id)?;
            job.heartbeat();
            Ok(())
        })
        .await
    }

    /// Fails a job abandoned by a crashed worker
    ///
    /// Succeeds only if the job is still `Running` under `stale_worker_id`,
    /// so a job whose owner came back to life in the meantime is left alone.
    pub async fn fail_stale(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        stale_worker_id: &str,
        message: &str,
    ) -> Result<Job, StoreError> {
        self.update(scenario_id, job_id, |job| {
            if job.status != JobStatus::Running || !job.is_owned_by(stale_worker_id) {
                return Err(StoreError::Conflict {
                    job_id,
                    reason: "job changed owner or state".to_string(),
                });
            }
            job.fail(JobFailureType::WorkerCrash, message)?;
            Ok(())
        })
        .await
    }

    /// Read-check-write under both locks
    ///
    /// The closure sees the freshest persisted record. If it returns an
    /// error nothing is written.
    pub async fn update<F>(
        &self,
        scenario_id: &str,
        job_id: Uuid,
        apply: F,
    ) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        check_component(scenario_id)?;
        let record = self.paths.job_record(scenario_id, job_id);
        let lock_path = self.paths.job_lock(scenario_id, job_id);

        let _local = self.local.lock().await;
        let lock = LockFile::acquire(&lock_path, job_id, self.lock_wait, self.lock_stale_after)
            .await?;

        let mut job = read_record(&record, job_id).await?;
        apply(&mut job)?;
        lock.verify(job_id).await?;
        write_atomic(&record, &job).await?;

        debug!("Job {} updated (status: {})", job_id, job.status);
        Ok(job)
    }

    async fn scenario_ids(&self) -> Result<Vec<String>, StoreError> {
        read_dir_names(&self.paths.scenarios_dir()).await
    }

    async fn list_scenario_unsorted(
        &self,
        scenario_id: &str,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        for name in read_dir_names(&self.paths.jobs_dir(scenario_id)).await? {
            let Ok(job_id) = Uuid::parse_str(&name) else {
                continue;
            };
            match read_record(&self.paths.job_record(scenario_id, job_id), job_id).await {
                Ok(job) => {
                    if status.is_none_or(|s| s == job.status) {
                        jobs.push(job);
                    }
                }
                // Directory created but record not yet renamed into place
                Err(StoreError::JobNotFound(_)) => {}
                Err(e) => warn!("Skipping unreadable job record {}: {}", job_id, e),
            }
        }
        Ok(jobs)
    }
}

fn ensure_owner(job: &Job, worker_id: &str) -> Result<(), StoreError> {
    if job.is_owned_by(worker_id) {
        Ok(())
    } else {
        Err(StoreError::NotOwner {
            job_id: job.id,
            worker_id: worker_id.to_string(),
        })
    }
}

async fn read_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

async fn read_record(path: &Path, job_id: Uuid) -> Result<Job, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::JobNotFound(job_id)),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes to a sibling temp file and renames it over the record
async fn write_atomic(path: &Path, job: &Job) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Exclusive cross-process lock held for the duration of one update
///
/// The file holds a per-acquire token. A lock older than `stale_after` is
/// broken by renaming it to a unique tombstone, so at most one contender
/// removes it; a live lock swapped in meanwhile is put back.
struct LockFile {
    path: PathBuf,
    token: String,
}

impl LockFile {
    async fn acquire(
        path: &Path,
        job_id: Uuid,
        wait: Duration,
        stale_after: Duration,
    ) -> Result<Self, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        let token = format!("{} {}\n", std::process::id(), Uuid::new_v4().simple());

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = write_token(&mut file, &token).await {
                        let _ = fs::remove_file(path).await;
                        return Err(e.into());
                    }
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(path).await.is_some_and(|age| age > stale_after) {
                        let observed = match fs::read_to_string(path).await {
                            Ok(observed) => observed,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        };
                        if break_stale_lock(path, &observed, stale_after).await? {
                            continue;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StoreError::JobNotFound(job_id));
                }
                Err(e) => return Err(e.into()),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::LockTimeout(job_id));
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }

    /// Fails if another contender broke this lock and took over
    async fn verify(&self, job_id: Uuid) -> Result<(), StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(current) if current == self.token => Ok(()),
            Ok(_) => Err(StoreError::Conflict {
                job_id,
                reason: "lock was taken over by another writer".to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::Conflict {
                job_id,
                reason: "lock was removed by another writer".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Never remove a lock someone else holds now
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to release lock {}: {}", self.path.display(), e);
                }
            }
            Ok(_) => warn!("Lock {} was taken over; leaving it", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release lock {}: {}", self.path.display(), e),
        }
    }
}

async fn write_token(file: &mut fs::File, token: &str) -> std::io::Result<()> {
    file.write_all(token.as_bytes()).await?;
    file.sync_data().await
}

/// Removes the lock at `path` if it is still the stale one `observed`
///
/// Returns whether a stale lock was removed. The rename is the only step
/// that can succeed for just one contender; the tombstone is then checked
/// to still be the observed, stale file.
async fn break_stale_lock(
    path: &Path,
    observed: &str,
    stale_after: Duration,
) -> Result<bool, StoreError> {
    let tombstone = path.with_extension(format!("lock.{}.stale", Uuid::new_v4().simple()));
    match fs::rename(path, &tombstone).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let taken = fs::read_to_string(&tombstone).await.unwrap_or_default();
    let still_stale = lock_age(&tombstone)
        .await
        .is_some_and(|age| age > stale_after);

    if taken == observed && still_stale {
        warn!("Removed stale lock file {}", path.display());
        let _ = fs::remove_file(&tombstone).await;
        return Ok(true);
    }

    // A live lock replaced the stale one after it was observed
    match fs::hard_link(&tombstone, path).await {
        Ok(()) => debug!("Restored live lock {}", path.display()),
        Err(e) => warn!(
            "Could not restore lock {}: {}; its holder will abort",
            path.display(),
            e
        ),
    }
    let _ = fs::remove_file(&tombstone).await;
    Ok(false)
}

async fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobType;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileJobStore {
        FileJobStore::new(StorePaths::new(dir.path()))
    }

    async fn waiting_job(store: &FileJobStore) -> Job {
        let job = Job::new("iris", JobType::Train, "train_default");
        store.create(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;

        let loaded = store.get("iris", job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Waiting);

        let found = store.find(job.id).await.unwrap();
        assert_eq!(found.scenario_id, "iris");

        assert!(matches!(
            store.create(&job).await,
            Err(StoreError::JobExists(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get("iris", id).await,
            Err(StoreError::JobNotFound(_))
        ));
        assert!(matches!(store.find(id).await, Err(StoreError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = waiting_job(&store).await;
        let second = waiting_job(&store).await;
        store.claim("iris", second.id, "worker-1").await.unwrap();

        let waiting = store.list(Some(JobStatus::Waiting)).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, first.id);

        let all = store.list_scenario("iris", None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;

        let claimed = store.claim("iris", job.id, "worker-1").await.unwrap();
        assert_eq!(claimed.status, JobStatus::Running);

        let err = store.claim("iris", job.id, "worker-2").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let loaded = store.get("iris", job.id).await.unwrap();
        assert!(loaded.is_owned_by("worker-1"));
        assert_eq!(loaded.status_history.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_one_winner() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        // Separate store instances behave like separate worker processes:
        // only the lock file protects them from each other.
        let stores: Vec<Arc<FileJobStore>> = (0..8)
            .map(|_| Arc::new(FileJobStore::new(paths.clone())))
            .collect();
        let job = waiting_job(&stores[0]).await;

        let mut handles = Vec::new();
        for (i, store) in stores.iter().enumerate() {
            let store = Arc::clone(store);
            handles.push(tokio::spawn(async move {
                store
                    .claim("iris", job.id, &format!("worker-{}", i))
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let loaded = stores[0].get("iris", job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.status_history.len(), 2);
    }

    #[tokio::test]
    async fn test_only_owner_can_finish() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;
        store.claim("iris", job.id, "worker-1").await.unwrap();

        assert!(matches!(
            store.complete("iris", job.id, "worker-2").await,
            Err(StoreError::NotOwner { .. })
        ));
        assert!(matches!(
            store.heartbeat("iris", job.id, "worker-2").await,
            Err(StoreError::NotOwner { .. })
        ));

        let failed = store
            .fail(
                "iris",
                job.id,
                "worker-1",
                JobFailureType::ProcessError,
                "exit code 2",
            )
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure_type, JobFailureType::ProcessError);
        assert!(failed.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_terminal_transition_rejected_by_store() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;
        assert!(matches!(
            store.complete("iris", job.id, "worker-1").await,
            Err(StoreError::NotOwner { .. })
        ));

        store.claim("iris", job.id, "worker-1").await.unwrap();
        store.complete("iris", job.id, "worker-1").await.unwrap();
        // Completed jobs have no owner, so a late fail is rejected
        assert!(
            store
                .fail("iris", job.id, "worker-1", JobFailureType::Timeout, "late")
                .await
                .is_err()
        );
        let loaded = store.get("iris", job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_fail_stale_requires_same_owner() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;
        store.claim("iris", job.id, "worker-1").await.unwrap();

        assert!(matches!(
            store
                .fail_stale("iris", job.id, "worker-9", "gone")
                .await,
            Err(StoreError::Conflict { .. })
        ));

        let failed = store
            .fail_stale("iris", job.id, "worker-1", "worker-1 stopped responding")
            .await
            .unwrap();
        assert_eq!(failed.failure_type, JobFailureType::WorkerCrash);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record_untouched() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = waiting_job(&store).await;

        let result = store
            .update("iris", job.id, |job| {
                job.model_id = Some("should-not-persist".to_string());
                Err(StoreError::Conflict {
                    job_id: job.id,
                    reason: "test".to_string(),
                })
            })
            .await;
        assert!(result.is_err());

        let loaded = store.get("iris", job.id).await.unwrap();
        assert!(loaded.model_id.is_none());
        assert!(!store.paths().job_lock("iris", job.id).exists());
    }

    #[tokio::test]
    async fn test_stale_lock_file_is_broken() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        store.lock_stale_after = Duration::from_millis(0);
        let job = waiting_job(&store).await;

        std::fs::write(store.paths().job_lock("iris", job.id), "4242\n").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let claimed = store.claim("iris", job.id, "worker-1").await.unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_stale_lock_broken_by_one_contender() {
        let dir = TempDir::new().unwrap();
        let mut a = store(&dir);
        let mut b = store(&dir);
        a.lock_stale_after = Duration::from_millis(200);
        b.lock_stale_after = Duration::from_millis(200);
        let job = waiting_job(&a).await;

        std::fs::write(a.paths().job_lock("iris", job.id), "4242 dead\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Two stores stand in for two worker processes
        let a = Arc::new(a);
        let b = Arc::new(b);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            let worker = format!("worker-{}", i);
            handles.push(tokio::spawn(async move {
                store.claim("iris", job.id, &worker).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners, 1);
        assert!(!a.paths().job_lock("iris", job.id).exists());
    }

    #[tokio::test]
    async fn test_live_lock_swapped_in_is_restored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.lock");

        // Observed as stale, then replaced by a fresh holder before the break
        std::fs::write(&path, "4242 dead\n").unwrap();
        std::fs::write(&path, "7 live\n").unwrap();

        let broken = break_stale_lock(&path, "4242 dead\n", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!broken);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7 live\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_taken_over_lock_refuses_to_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.lock");
        let job_id = Uuid::new_v4();

        let lock = LockFile::acquire(
            &path,
            job_id,
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        lock.verify(job_id).await.unwrap();

        std::fs::write(&path, "7 other\n").unwrap();
        assert!(matches!(
            lock.verify(job_id).await,
            Err(StoreError::Conflict { .. })
        ));

        drop(lock);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7 other\n");
    }

    #[tokio::test]
    async fn test_invalid_scenario_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = Job::new("../escape", JobType::Train, "train");
        assert!(matches!(
            store.create(&job).await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
