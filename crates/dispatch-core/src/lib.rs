//! dispatch-core: decide which pipelines and jobs run for a repository event.
//!
//! ## Key Components
//!
//! - [`change`]: map changed paths to affected components
//! - [`stack`]: identify each component's technology stack from signature files
//! - [`dispatcher`]: evaluate trigger rules, instantiate and de-duplicate jobs
//! - [`graph`]: job dependency graph with topological ordering
//!
//! The dispatcher is pure: the same event, configuration and stack index
//! always produce the same [`DispatchDecision`].

pub mod change;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod stack;
pub mod telemetry;

pub use change::{ChangeDetector, ChangeSet, PathMatch, PathOrigin};
pub use config::{
    default_label_rules, DispatchConfig, LabelEffect, LabelRule, RunnerSettings, SupersedePolicy,
};
pub use dispatcher::{
    dispatch, DispatchOutcome, DispatchSession, DispatchState, DispatchWarning, Dispatcher,
    TrailEntry,
};
pub use domain::{
    CacheKey, Capability, Component, ComponentSelector, DecisionJob, DispatchDecision,
    DispatchError, Event, EventPayload, EventType, GraphError, InvalidTransition, Job, JobKind,
    JobStatus, JobTemplate, Pipeline, PipelineType, Priority, Result, RunResult,
    SelectedPipeline, TriggerRule, ValidationError, INFRASTRUCTURE_COMPONENT,
};
pub use graph::JobGraph;
pub use metrics::METRICS;
pub use stack::{
    builtin_signatures, builtin_stack, FsSignatureSource, SignatureRule, SignatureSource,
    StackIndex, StackInfo, StackResolution, StackResolver, StaticSignatureSource,
};
pub use telemetry::init_tracing;
