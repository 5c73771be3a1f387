//! Worker configuration
//!
//! Defines all configurable parameters for the worker including
//! polling intervals, liveness timeouts, and the location of the job store.

use std::path::PathBuf;
use std::time::Duration;

/// Default deadline for a single external process (8 hours)
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

/// Worker configuration
///
/// All timeouts and intervals are configurable to allow tuning
/// for different deployment scenarios (laptop vs shared training box).
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance, recorded on claimed jobs
    pub worker_id: String,

    /// Root of the scenario store shared by all workers
    pub data_dir: PathBuf,

    /// How often to scan the store for waiting jobs
    pub poll_interval: Duration,

    /// How often owned jobs get their heartbeat refreshed
    pub heartbeat_interval: Duration,

    /// A running job older than this becomes a reclaim candidate
    pub job_timeout: Duration,

    /// ...but only once it has shown no activity for this long
    pub idle_timeout: Duration,

    /// Process deadline used when a step declares no timeout
    pub step_timeout: Duration,

    /// Max jobs this worker runs at the same time
    pub max_parallel_jobs: usize,

    /// External ML command-line tool used by train and predict steps
    pub ml_tool_path: String,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, data_dir: PathBuf) -> Self {
        Self {
            worker_id,
            data_dir,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            job_timeout: Duration::from_secs(24 * 60 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_parallel_jobs: 1,
            ml_tool_path: "mlnet".to_string(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (optional, default: random)
    /// - TRAINYARD_DATA_DIR (optional, default: ./data)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 30)
    /// - JOB_TIMEOUT (optional, seconds, default: 86400)
    /// - IDLE_TIMEOUT (optional, seconds, default: 600)
    /// - STEP_TIMEOUT (optional, seconds, default: 28800)
    /// - MAX_PARALLEL_JOBS (optional, default: 1)
    /// - ML_TOOL_PATH (optional, default: mlnet)
    ///
    /// A variable that is set but does not parse is an error, not a default.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds configuration from any name -> value source
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> anyhow::Result<Duration> {
            Ok(parse_var::<u64>(&lookup, name)?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };

        Ok(Self {
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            data_dir: lookup("TRAINYARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            poll_interval: secs("POLL_INTERVAL", defaults.poll_interval)?,
            heartbeat_interval: secs("HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            job_timeout: secs("JOB_TIMEOUT", defaults.job_timeout)?,
            idle_timeout: secs("IDLE_TIMEOUT", defaults.idle_timeout)?,
            step_timeout: secs("STEP_TIMEOUT", defaults.step_timeout)?,
            max_parallel_jobs: parse_var::<usize>(&lookup, "MAX_PARALLEL_JOBS")?
                .unwrap_or(defaults.max_parallel_jobs),
            ml_tool_path: lookup("ML_TOOL_PATH").unwrap_or(defaults.ml_tool_path),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir cannot be empty");
        }

        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        // Otherwise healthy jobs look abandoned between two heartbeats
        if self.heartbeat_interval >= self.idle_timeout {
            anyhow::bail!("heartbeat_interval must be shorter than idle_timeout");
        }

        if self.job_timeout.is_zero() {
            anyhow::bail!("job_timeout must be greater than 0");
        }

        if self.step_timeout.is_zero() {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        if self.ml_tool_path.trim().is_empty() {
            anyhow::bail!("ml_tool_path cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            PathBuf::from("./data"),
        )
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", raw, name, e)),
    }
}
