//! External process execution
//!
//! Runs ML tools and shell commands as child processes:
//! - stdout and stderr lines are forwarded to the job log as they arrive
//! - a deadline and the job's cancellation token bound every run
//! - on timeout or cancellation the whole process tree is killed
//!
//! The child is started in its own process group on Unix so that tools
//! spawning helpers of their own are cleaned up with them.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trainyard_core::domain::failure::JobFailureType;
use trainyard_core::domain::log::LogLevel;

use crate::config::DEFAULT_STEP_TIMEOUT;
use crate::context::LogSink;

/// Time allowed for buffered output to arrive after the child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a process that ran to completion
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub success: bool,
    /// `-1` when the process was ended by a signal
    pub exit_code: i32,
    pub standard_output: String,
    pub standard_error: String,
    pub error: Option<String>,
    pub processing_time: Duration,
}

/// Process error type
///
/// A non-zero exit is not an error here; see [`ProcessResult::success`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("'{command}' was cancelled")]
    Cancelled { command: String },

    #[error("failed to wait for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write process output to the job log: {0}")]
    Log(#[source] io::Error),
}

impl ProcessError {
    pub fn failure_type(&self) -> JobFailureType {
        match self {
            ProcessError::InvalidArguments(_) => JobFailureType::ConfigurationError,
            ProcessError::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                JobFailureType::FileNotFound
            }
            ProcessError::Spawn { .. } | ProcessError::Wait { .. } => JobFailureType::ProcessError,
            ProcessError::Timeout { .. } => JobFailureType::Timeout,
            // Only the worker cancels a running job, and only on shutdown
            ProcessError::Cancelled { .. } => JobFailureType::WorkerCrash,
            ProcessError::Log(e) if e.kind() == io::ErrorKind::StorageFull => {
                JobFailureType::ResourceExhausted
            }
            ProcessError::Log(_) => JobFailureType::UnknownError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Interrupt {
    TimedOut,
    Cancelled,
    LogFailed(io::Error),
}

/// Runs external processes with streaming, deadlines and tree kill
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    default_timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT)
    }
}

impl ProcessRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Runs `command` with a single argument string
    ///
    /// The string is split like a command line: whitespace separates
    /// arguments and single or double quotes group words. Nothing is
    /// expanded and no shell is involved.
    pub async fn run(
        &self,
        command: &str,
        arguments: &str,
        working_dir: &Path,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        sink: &dyn LogSink,
    ) -> Result<ProcessResult, ProcessError> {
        let argv = split_arguments(arguments)?;
        self.run_args(command, &argv, working_dir, timeout, cancel, sink)
            .await
    }

    /// Runs `command` with an already split argument vector
    pub async fn run_args(
        &self,
        command: &str,
        argv: &[String],
        working_dir: &Path,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        sink: &dyn LogSink,
    ) -> Result<ProcessResult, ProcessError> {
        let deadline = timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        debug!("Executing process: {} {:?} (deadline {:?})", command, argv, deadline);

        let mut cmd = Command::new(command);
        cmd.args(argv)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let pid = child.id();

        // Readers stop when this scope is dropped, whatever path returns
        let readers = CancellationToken::new();
        let _readers_guard = readers.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel::<(Stream, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_lines(stdout, Stream::Stdout, tx.clone(), readers.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_lines(stderr, Stream::Stderr, tx, readers.clone()));
        }

        let mut output = Output::default();
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);

        let mut output_open = true;
        let mut status: Option<ExitStatus> = None;

        let interrupt = loop {
            if status.is_some() {
                break None;
            }

            tokio::select! {
                line = rx.recv(), if output_open => match line {
                    Some((stream, text)) => {
                        if let Err(e) = output.forward(stream, text, sink).await {
                            break Some(Interrupt::LogFailed(e));
                        }
                    }
                    None => output_open = false,
                },
                waited = child.wait() => {
                    status = Some(waited.map_err(|source| ProcessError::Wait {
                        command: command.to_string(),
                        source,
                    })?);
                }
                _ = &mut sleep => break Some(Interrupt::TimedOut),
                _ = cancel.cancelled() => break Some(Interrupt::Cancelled),
            }
        };

        match interrupt {
            None => {
                // Helpers that inherited the pipes may still hold them open
                if output_open {
                    let drained = output.drain(&mut rx, sink).await;
                    if let Err(e) = drained {
                        let _ = kill_tree(&mut child, pid).await;
                        return Err(ProcessError::Log(e));
                    }
                }
                if output.truncated {
                    let _ = kill_tree(&mut child, pid).await;
                }
            }
            Some(interrupt) => {
                if let Err(e) = kill_tree(&mut child, pid).await {
                    warn!("Failed to kill process tree of '{}': {}", command, e);
                    let _ = sink
                        .log(
                            LogLevel::Warning,
                            &format!("Failed to kill process tree of '{}': {}", command, e),
                        )
                        .await;
                }
                let _ = child.wait().await;

                return Err(match interrupt {
                    Interrupt::LogFailed(e) => ProcessError::Log(e),
                    Interrupt::TimedOut => {
                        let _ = output.drain(&mut rx, sink).await;
                        info!("Process '{}' timed out after {:?}", command, deadline);
                        ProcessError::Timeout {
                            command: command.to_string(),
                            timeout: deadline,
                        }
                    }
                    Interrupt::Cancelled => {
                        let _ = output.drain(&mut rx, sink).await;
                        info!("Process '{}' cancelled", command);
                        ProcessError::Cancelled {
                            command: command.to_string(),
                        }
                    }
                });
            }
        }

        // The loop only breaks without an interrupt once the status is known
        let status = status.ok_or_else(|| ProcessError::Wait {
            command: command.to_string(),
            source: io::Error::other("process status unavailable"),
        })?;

        let exit_code = status.code().unwrap_or(-1);
        let success = status.success();
        let processing_time = started.elapsed();

        debug!(
            "Process '{}' exited with code {} after {:?}",
            command, exit_code, processing_time
        );

        Ok(ProcessResult {
            success,
            exit_code,
            standard_output: output.stdout,
            standard_error: output.stderr,
            error: (!success).then(|| format!("Process exited with code {}", exit_code)),
            processing_time,
        })
    }
}

#[derive(Default)]
struct Output {
    stdout: String,
    stderr: String,
    truncated: bool,
}

impl Output {
    async fn forward(&mut self, stream: Stream, line: String, sink: &dyn LogSink) -> io::Result<()> {
        let (buffer, level) = match stream {
            Stream::Stdout => (&mut self.stdout, LogLevel::Info),
            Stream::Stderr => (&mut self.stderr, LogLevel::Warning),
        };
        sink.log(level, &line).await?;
        buffer.push_str(&line);
        buffer.push('\n');
        Ok(())
    }

    /// Forwards lines still in flight, for at most [`DRAIN_GRACE`]
    async fn drain(
        &mut self,
        rx: &mut mpsc::Receiver<(Stream, String)>,
        sink: &dyn LogSink,
    ) -> io::Result<()> {
        let grace = tokio::time::sleep(DRAIN_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some((stream, text)) => self.forward(stream, text, sink).await?,
                    None => return Ok(()),
                },
                _ = &mut grace => {
                    self.truncated = true;
                    return Ok(());
                }
            }
        }
    }
}

async fn read_lines<R>(
    reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = stop.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

/// Kills the child and everything it started
///
/// `pid` is captured at spawn time since the child may already be reaped.
async fn kill_tree(child: &mut Child, pid: Option<u32>) -> io::Result<()> {
    let Some(pid) = pid else {
        return child.start_kill();
    };

    #[cfg(unix)]
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(windows)]
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    #[cfg(not(any(unix, windows)))]
    let status: io::Result<ExitStatus> = Err(io::Error::from(io::ErrorKind::Unsupported));

    match status {
        Ok(s) if s.success() => Ok(()),
        other => {
            debug!("Tree kill of {} did not succeed ({:?}); killing child only", pid, other);
            match child.start_kill() {
                // Already exited and reaped
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
                result => result,
            }
        }
    }
}

/// Splits an argument string into argv
///
/// Single or double quotes group words (including empty ones); quotes of
/// the other kind are literal inside them.
pub fn split_arguments(input: &str) -> Result<Vec<String>, ProcessError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(ProcessError::InvalidArguments(format!(
            "unterminated {} quote in '{}'",
            q, input
        )));
    }
    if in_token {
        args.push(current);
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<(LogLevel, String, Instant)>>,
    }

    impl RecordingSink {
        fn lines(&self) -> Vec<(LogLevel, String)> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .map(|(l, m, _)| (*l, m.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn log(&self, level: LogLevel, message: &str) -> io::Result<()> {
            self.lines
                .lock()
                .unwrap()
                .push((level, message.to_string(), Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn test_split_arguments() {
        assert_eq!(
            split_arguments("classification --dataset 'my data.csv' --label-col \"a b\"").unwrap(),
            vec!["classification", "--dataset", "my data.csv", "--label-col", "a b"]
        );
        assert_eq!(split_arguments("  a   b ").unwrap(), vec!["a", "b"]);
        assert_eq!(split_arguments("a \"\" b").unwrap(), vec!["a", "", "b"]);
        assert_eq!(split_arguments("\"it's\"").unwrap(), vec!["it's"]);
        assert!(split_arguments("").unwrap().is_empty());
        assert!(matches!(
            split_arguments("broken 'quote"),
            Err(ProcessError::InvalidArguments(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_forwarded_and_captured() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();
        let runner = ProcessRunner::default();

        let result = runner
            .run(
                "sh",
                "-c 'echo hello; echo oops >&2'",
                dir.path(),
                None,
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.standard_output, "hello\n");
        assert_eq!(result.standard_error, "oops\n");
        assert!(result.error.is_none());

        let lines = sink.lines();
        assert!(lines.contains(&(LogLevel::Info, "hello".to_string())));
        assert!(lines.contains(&(LogLevel::Warning, "oops".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lines_stream_while_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();

        ProcessRunner::default()
            .run(
                "sh",
                "-c 'echo first; sleep 1; echo second'",
                dir.path(),
                None,
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        let gap = lines[1].2.duration_since(lines[0].2);
        assert!(gap >= Duration::from_millis(700), "lines were batched: {:?}", gap);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();

        let result = ProcessRunner::default()
            .run(
                "sh",
                "-c 'exit 3'",
                dir.path(),
                None,
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_promptly() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();
        let started = Instant::now();

        let err = ProcessRunner::default()
            .run(
                "sleep",
                "10",
                dir.path(),
                Some(Duration::from_millis(100)),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert_eq!(err.failure_type(), JobFailureType::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ProcessRunner::default()
            .run("sleep", "10", dir.path(), None, &cancel, &sink)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Cancelled { .. }));
        assert_eq!(err.failure_type(), JobFailureType::WorkerCrash);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();

        let err = ProcessRunner::default()
            .run(
                "sh",
                "-c 'sleep 30 & echo $! > child.pid; wait'",
                dir.path(),
                Some(Duration::from_millis(500)),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));

        let pid = std::fs::read_to_string(dir.path().join("child.pid")).unwrap();
        let stat_path = format!("/proc/{}/stat", pid.trim());

        // The grandchild is gone, or a zombie waiting for init
        let mut alive = true;
        for _ in 0..20 {
            alive = match std::fs::read_to_string(&stat_path) {
                Ok(stat) => {
                    let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                    !state.starts_with('Z')
                }
                Err(_) => false,
            };
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "grandchild {} survived the timeout", pid.trim());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = RecordingSink::default();

        let err = ProcessRunner::default()
            .run(
                "definitely-not-a-real-tool-4821",
                "--help",
                dir.path(),
                None,
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(err.failure_type(), JobFailureType::FileNotFound);
    }
}
