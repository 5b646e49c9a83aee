//! The dispatch decision: which pipelines and jobs run for one event.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::digest;
use crate::domain::job::{CacheKey, Job, JobStatus};
use crate::domain::pipeline::{JobKind, PipelineType, Priority};

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// A job as it appears in the decision document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionJob {
    pub id: String,
    pub component_id: String,
    pub kind: JobKind,
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<CacheKey>,
}

impl DecisionJob {
    /// Fresh runtime job in `Queued` state.
    pub fn instantiate(&self, pipeline_id: &str) -> Job {
        Job {
            id: self.id.clone(),
            name: self.name.clone(),
            pipeline_id: pipeline_id.to_string(),
            template_id: self.template_id.clone(),
            component_id: self.component_id.clone(),
            kind: self.kind,
            stack: self.stack.clone(),
            environment: self.environment.clone(),
            required: self.required,
            dependencies: self.depends_on.iter().cloned().collect::<BTreeSet<_>>(),
            shared_from: self.shared_from.clone(),
            cache_key: self.cache_key.clone(),
            status: JobStatus::Queued,
            attempt_count: 0,
        }
    }
}

/// One pipeline chosen for the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPipeline {
    #[serde(rename = "id")]
    pub pipeline_id: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    pub priority: Priority,
    pub reason: String,
    pub jobs: Vec<DecisionJob>,
}

impl SelectedPipeline {
    pub fn instantiate_jobs(&self) -> Vec<Job> {
        self.jobs
            .iter()
            .map(|j| j.instantiate(&self.pipeline_id))
            .collect()
    }

    pub fn job(&self, id: &str) -> Option<&DecisionJob> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Deterministic mapping from one event to the work it triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDecision {
    pub event_id: String,
    #[serde(rename = "pipelines")]
    pub selected_pipelines: Vec<SelectedPipeline>,
}

impl DispatchDecision {
    pub fn is_empty(&self) -> bool {
        self.selected_pipelines.is_empty()
    }

    pub fn job_count(&self) -> usize {
        self.selected_pipelines.iter().map(|p| p.jobs.len()).sum()
    }

    pub fn pipeline(&self, id: &str) -> Option<&SelectedPipeline> {
        self.selected_pipelines.iter().find(|p| p.pipeline_id == id)
    }

    pub fn pipeline_ids(&self) -> Vec<&str> {
        self.selected_pipelines
            .iter()
            .map(|p| p.pipeline_id.as_str())
            .collect()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 over the canonical JSON of the decision.
    pub fn digest(&self) -> String {
        digest::compute_digest(&self.to_value())
    }
}
