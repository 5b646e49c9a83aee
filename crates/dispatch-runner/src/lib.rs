//! dispatch-runner: executes the job graph of a dispatch decision.
//!
//! - [`PipelineRunner`] runs jobs on a bounded worker pool, retrying
//!   transient failures with capped exponential backoff and skipping the
//!   dependents of failed jobs
//! - [`RunSupervisor`] cancels stale runs when a newer event targets the
//!   same ref
//! - [`BuildCache`] collapses concurrent dependency installs per cache key
//! - [`report`] aggregates job results into pipeline and run status
//! - [`RunAudit`] checks the transitions recorded in the run ledger

pub mod audit;
pub mod cache;
pub mod commands;
pub mod error;
pub mod executor;
pub mod report;
pub mod retry;
pub mod routing;
pub mod runner;
pub mod supervisor;

pub use audit::{AuditVerdict, RunAudit, JOB_TRANSITION};
pub use cache::{BuildCache, CacheEntry};
pub use commands::CommandTable;
pub use error::{CacheError, JobError, RunnerError, RunnerResult};
pub use executor::{run_command, CommandExecutor, DryRunExecutor, JobContext, JobExecutor, JobOutput};
pub use report::{
    aggregate, render_run_report_md, write_run_report_json, write_run_report_md, JobReport,
    PipelineReport, PipelineStatus, RunReport,
};
pub use retry::RetryPolicy;
pub use routing::{ChangeProposal, ContentGenerator, PushRequest, RegistryClient, RoutingExecutor};
pub use runner::PipelineRunner;
pub use supervisor::{RunSupervisor, RunTicket};
