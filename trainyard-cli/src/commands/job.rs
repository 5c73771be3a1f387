//! Job command handlers
//!
//! Handles all job-related CLI commands including enqueuing, listing,
//! viewing details, and reading logs.

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::*;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use trainyard_core::domain::job::{Job, JobStatus, JobType};
use trainyard_core::dto::job::CreateJob;
use trainyard_core::store::FileJobStore;

use crate::config::Config;
use crate::id_resolver::{IdOrPrefix, resolve_job};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a new job
    Enqueue {
        /// Scenario the job belongs to
        #[arg(short, long)]
        scenario: String,

        /// Job type (train or predict)
        #[arg(short = 't', long = "type")]
        job_type: JobType,

        /// Workflow to run
        #[arg(short, long)]
        workflow: String,

        /// Model produced or used by the job
        #[arg(short, long)]
        model: Option<String>,

        /// Job variables (key=value, values parsed as JSON when possible)
        #[arg(short, long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },
    /// List jobs
    List {
        /// Only jobs in this status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Only jobs of this scenario
        #[arg(short, long)]
        scenario: Option<String>,
    },
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Print the job log
    Logs {
        /// Job ID or unambiguous prefix
        id: String,

        /// Keep printing new lines until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl From<StatusArg> for JobStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Waiting => JobStatus::Waiting,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
        }
    }
}

/// Parse a single key=value pair
fn parse_key_val(s: &str) -> Result<(String, String)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// `3` becomes a number and `true` a bool; anything that is not JSON stays a string
fn variable_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Routes job subcommands to their respective handlers
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let store = config.job_store();

    match command {
        JobCommands::Enqueue {
            scenario,
            job_type,
            workflow,
            model,
            vars,
        } => {
            let request = CreateJob {
                scenario_id: scenario,
                job_type,
                workflow_name: workflow,
                model_id: model,
                variables: vars
                    .into_iter()
                    .map(|(k, v)| (k, variable_value(&v)))
                    .collect::<HashMap<_, _>>(),
            };
            enqueue_job(&store, config, request).await
        }
        JobCommands::List { status, scenario } => {
            list_jobs(&store, status.map(Into::into), scenario.as_deref()).await
        }
        JobCommands::Get { id } => get_job(&store, &id).await,
        JobCommands::Logs { id, follow } => get_job_logs(&store, &id, follow).await,
    }
}

/// Persist a new waiting job
async fn enqueue_job(store: &FileJobStore, config: &Config, request: CreateJob) -> Result<()> {
    // Reported only; the worker loads the definition again when the job starts
    match config
        .workflow_store()
        .load(&request.scenario_id, &request.workflow_name)
        .await
    {
        Ok(workflow) if workflow.workflow_type != request.job_type => println!(
            "{}",
            format!(
                "⚠ Workflow '{}' is a {} workflow, not {}",
                workflow.name, workflow.workflow_type, request.job_type
            )
            .yellow()
        ),
        Ok(_) => {}
        Err(e) => println!("{}", format!("⚠ {}", e).yellow()),
    }

    let job: Job = request.into();
    store
        .create(&job)
        .await
        .context("Failed to enqueue job")?;

    println!("{}", "✓ Job enqueued".green().bold());
    println!("  ID:       {}", job.id.to_string().cyan());
    println!("  Scenario: {}", job.scenario_id);
    println!("  Workflow: {}", job.workflow_name);

    Ok(())
}

/// List jobs, oldest first
async fn list_jobs(
    store: &FileJobStore,
    status: Option<JobStatus>,
    scenario: Option<&str>,
) -> Result<()> {
    let jobs = match scenario {
        Some(scenario) => store.list_scenario(scenario, status).await,
        None => store.list(status).await,
    }
    .context("Failed to list jobs")?;

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Get and display a single job
async fn get_job(store: &FileJobStore, id: &str) -> Result<()> {
    let job = resolve_job(store, &IdOrPrefix::parse(id)).await?;
    print_job_details(&job);
    Ok(())
}

/// Print the job log, optionally following it until the job is terminal
async fn get_job_logs(store: &FileJobStore, id: &str, follow: bool) -> Result<()> {
    let job = resolve_job(store, &IdOrPrefix::parse(id)).await?;
    let log_path = store.paths().job_log(&job.scenario_id, job.id);

    println!("{}", format!("Logs for job {}:", job.id).bold());
    println!("{}", "─".repeat(80).dimmed());

    let mut offset = 0;
    let mut pending = String::new();
    offset += print_new_lines(&log_path, offset, &mut pending).await?;

    if follow {
        let mut status = job.status;
        while !status.is_terminal() {
            tokio::time::sleep(FOLLOW_INTERVAL).await;
            status = store
                .get(&job.scenario_id, job.id)
                .await
                .context("Failed to refresh job status")?
                .status;
            offset += print_new_lines(&log_path, offset, &mut pending).await?;
        }

        // The final status line is appended right after the record turns terminal
        tokio::time::sleep(FOLLOW_INTERVAL).await;
        print_new_lines(&log_path, offset, &mut pending).await?;
    } else if offset == 0 {
        println!("{}", "No logs found for this job.".yellow());
    }

    if !pending.is_empty() {
        print_log_line(&pending);
    }

    println!("{}", "─".repeat(80).dimmed());
    if follow {
        let job = store.get(&job.scenario_id, job.id).await?;
        println!("Job finished: {}", colorize_status(&job.status));
    }

    Ok(())
}

/// Prints every complete line past `offset`; returns the bytes consumed
///
/// A trailing partial line is kept in `pending` until its newline arrives.
async fn print_new_lines(path: &Path, offset: u64, pending: &mut String) -> Result<u64> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open log {}", path.display()));
        }
    };

    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;

    pending.push_str(&String::from_utf8_lossy(&bytes));
    while let Some(end) = pending.find('\n') {
        let line: String = pending.drain(..=end).collect();
        print_log_line(line.trim_end_matches(['\n', '\r']));
    }

    Ok(bytes.len() as u64)
}

/// Splits `<timestamp> [LEVEL] message`
fn parse_log_line(line: &str) -> Option<(&str, &str, &str)> {
    let (timestamp, rest) = line.split_once(" [")?;
    let (level, message) = rest.split_once("] ")?;
    Some((timestamp, level, message))
}

/// Print a log line with its level colorized
fn print_log_line(line: &str) {
    match parse_log_line(line) {
        Some((timestamp, level, message)) => {
            let level_colored = match level {
                "DEBUG" => level.dimmed(),
                "INFO" => level.cyan(),
                "WARN" => level.yellow(),
                "ERROR" => level.red(),
                other => other.normal(),
            };
            println!("{} [{}] {}", timestamp.dimmed(), level_colored, message);
        }
        None => println!("{}", line),
    }
}

/// Print a job summary
fn print_job_summary(job: &Job) {
    let status_colored = colorize_status(&job.status);

    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Scenario: {}", job.scenario_id);
    println!("    Type:     {}", job.job_type);
    println!("    Workflow: {}", job.workflow_name);
    println!("    Status:   {}", status_colored);
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(worker) = &job.worker_id {
        println!("    Worker:   {}", worker.dimmed());
    }
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    let status_colored = colorize_status(&job.status);

    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Scenario:    {}", job.scenario_id);
    println!("  Type:        {}", job.job_type);
    println!("  Workflow:    {}", job.workflow_name);
    if let Some(model) = &job.model_id {
        println!("  Model:       {}", model);
    }
    println!("  Status:      {}", status_colored);
    println!(
        "  Created:     {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    let finished = job.completed_at.or(job.failed_at);
    if let Some(finished) = finished {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = job.started_at {
            let seconds = finished.signed_duration_since(started).num_seconds();
            println!("  Duration:    {}s", seconds);
        }
    }

    if let Some(worker) = &job.worker_id {
        println!("  Worker:      {}", worker);
    }
    if let Some(heartbeat) = job.last_heartbeat_at {
        println!("  Heartbeat:   {}", heartbeat.format("%Y-%m-%d %H:%M:%S"));
    }

    if !job.variables.is_empty() {
        println!("\n{}", "Variables:".bold());
        let mut keys: Vec<&String> = job.variables.keys().collect();
        keys.sort();
        for key in keys {
            println!("  {} = {}", key.cyan(), job.variables[key]);
        }
    }

    if job.status == JobStatus::Failed {
        println!("\n{}", "Failure:".bold());
        println!("  Type:    {}", job.failure_type.to_string().red());
        if let Some(message) = &job.error_message {
            println!("  Message: {}", message.red());
        }
    }

    if !job.status_history.is_empty() {
        println!("\n{}", "History:".bold());
        for entry in &job.status_history {
            let mut line = format!(
                "  {} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                colorize_status(&entry.status)
            );
            if let Some(worker) = &entry.worker_id {
                line.push_str(&format!(" ({})", worker));
            }
            if let Some(message) = &entry.message {
                line.push_str(&format!(": {}", message));
            }
            println!("{}", line);
        }
    }
}

/// Colorize job status for display
fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Waiting => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
    }
}
