//! Repository events as ingested by the dispatcher.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::digest;
use crate::domain::error::ValidationError;

/// Kind of repository event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    PullRequest,
    Tag,
    Schedule,
    Manual,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::PullRequest => "pull_request",
            EventType::Tag => "tag",
            EventType::Schedule => "schedule",
            EventType::Manual => "manual",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event JSON exactly as it arrives on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
}

/// A validated, immutable repository event.
///
/// Only constructible through [`Event::from_payload`] / [`Event::from_json`],
/// so every `Event` in the system has passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    id: String,
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(rename = "ref")]
    git_ref: String,
    changed_files: BTreeSet<String>,
    labels: BTreeSet<String>,
    actor: String,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    inputs: BTreeMap<String, String>,
}

impl Event {
    /// Parse and validate an ingestion JSON document.
    pub fn from_json(json: &str) -> Result<Self, ValidationError> {
        let payload: EventPayload = serde_json::from_str(json)
            .map_err(|e| ValidationError::MalformedEvent(e.to_string()))?;
        Self::from_payload(payload)
    }

    /// Validate a payload and normalize it into an `Event`.
    pub fn from_payload(payload: EventPayload) -> Result<Self, ValidationError> {
        let git_ref = payload.git_ref.trim().to_string();
        if git_ref.is_empty() {
            return Err(malformed("ref must not be empty"));
        }
        let actor = payload.actor.trim().to_string();
        if actor.is_empty() {
            return Err(malformed("actor must not be empty"));
        }

        let mut changed_files = BTreeSet::new();
        for raw in &payload.changed_files {
            changed_files.insert(normalize_path(raw)?);
        }

        let mut labels = BTreeSet::new();
        for raw in &payload.labels {
            let label = raw.trim();
            if label.is_empty() {
                return Err(malformed("labels must not be empty strings"));
            }
            labels.insert(label.to_string());
        }

        let schedule = match payload.schedule {
            Some(name) if payload.event_type != EventType::Schedule => {
                return Err(malformed(&format!(
                    "schedule '{name}' given for a {} event",
                    payload.event_type
                )));
            }
            Some(name) if name.trim().is_empty() => {
                return Err(malformed("schedule name must not be empty"));
            }
            other => other.map(|s| s.trim().to_string()),
        };

        if !payload.inputs.is_empty() && payload.event_type != EventType::Manual {
            return Err(malformed("inputs are only accepted on manual events"));
        }

        let id = match payload.id {
            Some(id) if id.trim().is_empty() => return Err(malformed("id must not be empty")),
            Some(id) => id.trim().to_string(),
            None => canonical_id(
                payload.event_type,
                &git_ref,
                &changed_files,
                &labels,
                schedule.as_deref(),
                &payload.inputs,
            ),
        };

        Ok(Self {
            id,
            event_type: payload.event_type,
            git_ref,
            changed_files,
            labels,
            actor,
            timestamp: payload.timestamp,
            schedule,
            inputs: payload.inputs,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    /// The ref with any `refs/heads/`, `refs/tags/` or `refs/pull/` prefix removed.
    pub fn short_ref(&self) -> &str {
        ["refs/heads/", "refs/tags/", "refs/pull/"]
            .iter()
            .find_map(|prefix| self.git_ref.strip_prefix(prefix))
            .unwrap_or(&self.git_ref)
    }

    pub fn changed_files(&self) -> &BTreeSet<String> {
        &self.changed_files
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    pub fn inputs(&self) -> &BTreeMap<String, String> {
        &self.inputs
    }
}

fn malformed(reason: &str) -> ValidationError {
    ValidationError::MalformedEvent(reason.to_string())
}

/// Normalize a changed path to a clean, repository-relative form.
fn normalize_path(raw: &str) -> Result<String, ValidationError> {
    let path = raw.trim().replace('\\', "/");
    let path = path.trim_start_matches("./");
    if path.is_empty() {
        return Err(malformed("changed_files entries must not be empty"));
    }
    if path.starts_with('/') {
        return Err(malformed(&format!("changed file '{raw}' is not repository-relative")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(malformed(&format!("changed file '{raw}' escapes the repository")));
    }
    Ok(path.to_string())
}

/// Deterministic id derived from the fields that drive dispatch.
fn canonical_id(
    event_type: EventType,
    git_ref: &str,
    changed_files: &BTreeSet<String>,
    labels: &BTreeSet<String>,
    schedule: Option<&str>,
    inputs: &BTreeMap<String, String>,
) -> String {
    let canonical = serde_json::json!({
        "type": event_type,
        "ref": git_ref,
        "changed_files": changed_files,
        "labels": labels,
        "schedule": schedule,
        "inputs": inputs,
    });
    let hex = digest::sha256_hex(canonical.to_string().as_bytes());
    format!("evt-{}", &hex[..16])
}
