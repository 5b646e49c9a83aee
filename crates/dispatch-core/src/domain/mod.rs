//! Domain models for the dispatch engine.
//!
//! Canonical definitions for the core entities:
//! - `Event`: a validated repository event
//! - `Component`: a path-defined unit of the repository
//! - `Pipeline` / `JobTemplate`: what may run, and when
//! - `Job` / `RunResult`: concrete work and its outcome
//! - `DispatchDecision`: the per-event output of the dispatcher

pub mod component;
pub mod decision;
pub mod digest;
pub mod error;
pub mod event;
pub mod job;
pub mod pipeline;

pub use component::{Capability, Component, INFRASTRUCTURE_COMPONENT};
pub use decision::{DecisionJob, DispatchDecision, SelectedPipeline};
pub use error::{DispatchError, GraphError, InvalidTransition, Result, ValidationError};
pub use event::{Event, EventPayload, EventType};
pub use job::{CacheKey, Job, JobStatus, RunResult};
pub use pipeline::{
    ComponentSelector, JobKind, JobTemplate, Pipeline, PipelineType, Priority, TriggerRule,
};
