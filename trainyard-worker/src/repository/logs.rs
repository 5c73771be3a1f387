//! Durable job log writer
//!
//! Appends lines to per-job log files that readers tail while the job runs.
//! Each call opens the file in append mode, writes one complete record, and
//! syncs it before returning; nothing is buffered across calls.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Retry schedule for failed appends
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further retry
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

/// Serialized, retrying appender for job logs
///
/// The write lock orders appends made through this writer only. Another
/// process appending to the same file is not ordered against it.
pub struct DurableLogWriter {
    write_lock: Mutex<()>,
    retry: RetryPolicy,
}

impl DurableLogWriter {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            write_lock: Mutex::new(()),
            retry,
        }
    }

    /// Appends `text` plus a newline to the file at `path`
    ///
    /// Any I/O failure (a file held open exclusively by another process, a
    /// directory that briefly cannot be created) is retried with exponential
    /// backoff; the last error is returned once retries are exhausted.
    pub async fn append_line(&self, path: &Path, text: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut record = String::with_capacity(text.len() + 1);
        record.push_str(text);
        record.push('\n');

        let mut delay = self.retry.initial_backoff;
        let mut attempt = 0;
        loop {
            match append_once(path, record.as_bytes()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        "Log append to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        path.display(),
                        attempt,
                        self.retry.max_retries,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for DurableLogWriter {
    fn default() -> Self {
        Self::new()
    }
}

async fn append_once(path: &Path, record: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    // One write per record keeps lines whole under O_APPEND
    file.write_all(record).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
