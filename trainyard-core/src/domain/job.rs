//! Job domain types
//!
//! A job is one unit of train or predict work. Its lifecycle is a small state
//! machine: `Waiting -> Running -> {Completed, Failed}`. Every transition
//! appends exactly one entry to the status history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use super::failure::JobFailureType;

/// Job record
///
/// Structure shared between the enqueuer (creates) and workers (update).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub scenario_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub workflow_name: String,
    pub model_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    #[serde(default)]
    pub failure_type: JobFailureType,
    pub error_message: Option<String>,
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(alias = "train")]
    Train,
    #[serde(alias = "predict")]
    Predict,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "Waiting"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Train => write!(f, "Train"),
            JobType::Predict => write!(f, "Predict"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(JobType::Train),
            "predict" => Ok(JobType::Predict),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// One entry of the append-only status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub message: Option<String>,
}

/// Rejected state machine transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job transition from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    /// Creates a new job in `Waiting` with its initial history entry
    pub fn new(
        scenario_id: impl Into<String>,
        job_type: JobType,
        workflow_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scenario_id: scenario_id.into(),
            job_type,
            status: JobStatus::Waiting,
            worker_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_heartbeat_at: None,
            workflow_name: workflow_name.into(),
            model_id: None,
            variables: HashMap::new(),
            status_history: vec![StatusHistoryEntry {
                status: JobStatus::Waiting,
                timestamp: now,
                worker_id: None,
                message: Some("Job created".to_string()),
            }],
            failure_type: JobFailureType::None,
            error_message: None,
        }
    }

    /// Takes ownership of a waiting job
    pub fn claim(&mut self, worker_id: &str) -> Result<(), TransitionError> {
        self.check_transition(JobStatus::Running)?;
        let now = self.next_timestamp();

        self.status = JobStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
        self.push_history(now, Some(worker_id.to_string()), None);

        Ok(())
    }

    /// Marks a running job as successfully finished
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.check_transition(JobStatus::Completed)?;
        let now = self.next_timestamp();
        let worker_id = self.worker_id.take();

        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.push_history(now, worker_id, None);

        Ok(())
    }

    /// Marks a running job as failed with a classified reason
    pub fn fail(
        &mut self,
        failure_type: JobFailureType,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.check_transition(JobStatus::Failed)?;
        let now = self.next_timestamp();
        let worker_id = self.worker_id.take();
        let message = message.into();

        self.status = JobStatus::Failed;
        self.failed_at = Some(now);
        self.failure_type = failure_type;
        self.error_message = Some(message.clone());
        self.push_history(now, worker_id, Some(message));

        Ok(())
    }

    /// Records liveness of the owning worker
    pub fn heartbeat(&mut self) {
        self.last_heartbeat_at = Some(Utc::now());
    }

    /// Whether `worker_id` currently owns this job
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }

    fn check_transition(&self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    // History timestamps never go backwards, even if the wall clock does.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.status_history.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }

    fn push_history(
        &mut self,
        timestamp: DateTime<Utc>,
        worker_id: Option<String>,
        message: Option<String>,
    ) {
        self.status_history.push(StatusHistoryEntry {
            status: self.status,
            timestamp,
            worker_id,
            message,
        });
    }
}
