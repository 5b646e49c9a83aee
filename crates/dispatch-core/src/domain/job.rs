//! Jobs, their state machine and execution results.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::InvalidTransition;
use crate::domain::pipeline::JobKind;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Skipped)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of the shared build/dependency cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub component_id: String,
    pub stack: String,
    /// SHA-256 of the stack lockfile, or `none` when it has no lockfile.
    pub lockfile_hash: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = &self.lockfile_hash[..12.min(self.lockfile_hash.len())];
        write!(f, "{}/{}/{}", self.component_id, self.stack, hash)
    }
}

/// A concrete unit of work inside one pipeline of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// `<pipeline>:<component>:<name>`
    pub id: String,
    pub name: String,
    pub pipeline_id: String,
    pub template_id: String,
    pub component_id: String,
    pub kind: JobKind,
    pub stack: Option<String>,
    pub environment: Option<String>,
    pub required: bool,
    pub dependencies: BTreeSet<String>,
    /// Id of the job whose execution this one reuses.
    pub shared_from: Option<String>,
    pub cache_key: Option<CacheKey>,
    pub status: JobStatus,
    pub attempt_count: u32,
}

impl Job {
    pub fn job_id(pipeline_id: &str, component_id: &str, name: &str) -> String {
        format!("{pipeline_id}:{component_id}:{name}")
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    /// Entering `Running` counts an attempt.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Running {
            self.attempt_count += 1;
        }
        self.status = next;
        Ok(())
    }

    pub fn is_alias(&self) -> bool {
        self.shared_from.is_some()
    }
}

/// Outcome of executing (or skipping) one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: String,
    pub status: JobStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    /// Digest of the job log in the log store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_from: Option<String>,
}

impl RunResult {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            duration_ms: 0,
            attempts: 0,
            logs_ref: None,
            error: None,
            shared_from: None,
        }
    }
}
