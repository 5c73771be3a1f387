//! ID resolver module
//!
//! Lets users name a job by a short, unambiguous prefix of its UUID instead
//! of the full id.

use anyhow::{Context, Result, anyhow};
use trainyard_core::domain::job::Job;
use trainyard_core::store::FileJobStore;
use uuid::Uuid;

/// Identifier that can be either a full UUID or an unambiguous prefix
#[derive(Debug, Clone, PartialEq)]
pub enum IdOrPrefix {
    Full(Uuid),
    Prefix(String),
}

impl IdOrPrefix {
    /// Attempts to parse as a full UUID first, otherwise treats as a prefix
    pub fn parse(input: &str) -> Self {
        match Uuid::parse_str(input) {
            Ok(uuid) => IdOrPrefix::Full(uuid),
            Err(_) => IdOrPrefix::Prefix(input.trim().to_lowercase()),
        }
    }
}

impl std::fmt::Display for IdOrPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdOrPrefix::Full(uuid) => write!(f, "{}", uuid),
            IdOrPrefix::Prefix(prefix) => write!(f, "{}", prefix),
        }
    }
}

/// Resolve a job ID or prefix to the stored job
///
/// A full UUID is looked up directly. A prefix is matched against every job
/// in every scenario and must select exactly one.
pub async fn resolve_job(store: &FileJobStore, id: &IdOrPrefix) -> Result<Job> {
    let prefix = match id {
        IdOrPrefix::Full(uuid) => {
            return store
                .find(*uuid)
                .await
                .with_context(|| format!("Failed to fetch job {}", uuid));
        }
        IdOrPrefix::Prefix(prefix) => prefix,
    };

    if prefix.is_empty() {
        return Err(anyhow!("Job ID must not be empty"));
    }

    let jobs = store
        .list(None)
        .await
        .context("Failed to list jobs for ID resolution")?;

    let mut matches: Vec<Job> = jobs
        .into_iter()
        .filter(|job| job.id.to_string().starts_with(prefix.as_str()))
        .collect();

    match matches.len() {
        0 => Err(anyhow!("No job found with ID starting with '{}'", prefix)),
        1 => Ok(matches.remove(0)),
        _ => {
            let ids: Vec<String> = matches.iter().map(|j| j.id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
