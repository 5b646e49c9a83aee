//! Error taxonomy for dispatch evaluation.

use crate::domain::job::JobStatus;

/// Malformed events or configuration. Fatal to the current dispatch: no
/// partial decision is ever produced alongside one of these.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("malformed configuration: {0}")]
    MalformedConfig(String),

    #[error("cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("configuration defines no {what}")]
    MissingConfiguration { what: String },

    #[error("{what} id must not be empty")]
    EmptyId { what: String },

    #[error("duplicate component id: {id}")]
    DuplicateComponent { id: String },

    #[error("component id '{id}' is reserved")]
    ReservedComponent { id: String },

    #[error("component {id} has no path patterns")]
    NoPathPatterns { id: String },

    #[error("invalid glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("duplicate pipeline id: {id}")]
    DuplicatePipeline { id: String },

    #[error("pipeline {pipeline} has no trigger rules")]
    NoTriggerRules { pipeline: String },

    #[error("pipeline {pipeline} has no job templates")]
    NoJobTemplates { pipeline: String },

    #[error("duplicate job template {template} in pipeline {pipeline}")]
    DuplicateTemplate { pipeline: String, template: String },

    #[error("template {pipeline}/{template} depends on unknown template {dependency}")]
    UnknownDependency {
        pipeline: String,
        template: String,
        dependency: String,
    },

    #[error("template {pipeline}/{template} selects unknown component {component}")]
    UnknownComponent {
        pipeline: String,
        template: String,
        component: String,
    },

    #[error("job templates in pipeline {pipeline} form a cycle: {templates:?}")]
    TemplateCycle {
        pipeline: String,
        templates: Vec<String>,
    },

    #[error("label rule for '{label}' is invalid: {reason}")]
    InvalidLabelRule { label: String, reason: String },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("job id {job} produced twice in pipeline {pipeline}")]
    DuplicateJob { pipeline: String, job: String },
}

/// Errors raised while building or walking a job DAG.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle detected involving: {nodes:?}")]
    Cycle { nodes: Vec<String> },

    #[error("node not found in graph: {id}")]
    NodeNotFound { id: String },

    #[error("duplicate node in graph: {id}")]
    DuplicateNode { id: String },
}

/// A job state change the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition for {job_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Dispatch-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("job graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("dispatch session is {state}, expected {expected}")]
    InvalidState { state: String, expected: String },

    #[error("audit log error: {0}")]
    Audit(#[from] dispatch_state::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
