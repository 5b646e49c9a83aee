//! Structured observability hooks for dispatch and run lifecycle events.
//!
//! This module provides:
//! - Event-scoped tracing spans via the `DispatchSpan` RAII guard
//! - Emission functions for key lifecycle events: dispatch evaluation,
//!   pipeline selection, job transitions, retries, run completion
//!
//! Events are emitted at `info!` level (warnings at `warn!`); filter them
//! with `RUST_LOG`.

use tracing::{info, warn};

/// RAII guard that enters an event-scoped span for the duration of a
/// dispatch or run.
///
/// # Example
///
/// ```ignore
/// let _span = DispatchSpan::enter("evt-3f2a9c01b7d4e655");
/// // every tracing call below carries event_id = "evt-3f2a9c01b7d4e655"
/// ```
pub struct DispatchSpan {
    _span: tracing::span::EnteredSpan,
}

impl DispatchSpan {
    pub fn enter(event_id: &str) -> Self {
        let span = tracing::info_span!("dispatch", event_id = %event_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: dispatch evaluation finished.
pub fn emit_dispatch_evaluated(event_id: &str, event_type: &str, pipelines: usize, jobs: usize) {
    info!(
        event = "dispatch.evaluated",
        event_id = %event_id,
        event_type = %event_type,
        pipelines = pipelines,
        jobs = jobs,
    );
}

/// Emit event: a pipeline made it into the decision.
pub fn emit_pipeline_selected(event_id: &str, pipeline_id: &str, priority: &str, jobs: usize) {
    info!(
        event = "pipeline.selected",
        event_id = %event_id,
        pipeline_id = %pipeline_id,
        priority = %priority,
        jobs = jobs,
    );
}

/// Emit warning: no pipeline matched a non-schedule event.
pub fn emit_no_pipeline_matched(event_id: &str, event_type: &str, git_ref: &str) {
    warn!(
        event = "dispatch.ambiguity",
        event_id = %event_id,
        event_type = %event_type,
        git_ref = %git_ref,
        "no pipeline matched event"
    );
}

/// Emit warning: a component has no recognisable stack signature.
pub fn emit_stack_unknown(component_id: &str, root: &str) {
    warn!(
        event = "stack.unknown",
        component_id = %component_id,
        root = %root,
        "no stack signature found; stack-specific jobs will be omitted"
    );
}

/// Emit event: a decision was appended to the audit log.
pub fn emit_decision_recorded(event_id: &str, digest: &str) {
    info!(event = "decision.recorded", event_id = %event_id, digest = %digest);
}

/// Emit event: a run started executing a decision.
pub fn emit_run_started(run_id: &str, event_id: &str, git_ref: &str, jobs: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        event_id = %event_id,
        git_ref = %git_ref,
        jobs = jobs,
    );
}

/// Emit event: a job changed state.
pub fn emit_job_transition(run_id: &str, job_id: &str, from: &str, to: &str, attempt: u32) {
    info!(
        event = "job.transition",
        run_id = %run_id,
        job_id = %job_id,
        from = %from,
        to = %to,
        attempt = attempt,
    );
}

/// Emit event: a transient failure will be retried after `delay_ms`.
pub fn emit_job_retry(run_id: &str, job_id: &str, attempt: u32, delay_ms: u64, error: &str) {
    warn!(
        event = "job.retry",
        run_id = %run_id,
        job_id = %job_id,
        attempt = attempt,
        delay_ms = delay_ms,
        error = %error,
    );
}

/// Emit event: a run was superseded by a newer event on the same ref.
pub fn emit_run_superseded(git_ref: &str, stale_event_id: &str, new_event_id: &str) {
    info!(
        event = "run.superseded",
        git_ref = %git_ref,
        stale_event_id = %stale_event_id,
        new_event_id = %new_event_id,
    );
}

/// Emit event: run finished with duration and aggregated status.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, jobs: usize, status: &str) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        jobs = jobs,
        status = %status,
    );
}

/// Emit event: run persistence error (warning level). Execution continues.
pub fn emit_ledger_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.ledger_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_span_create() {
        let _span = DispatchSpan::enter("evt-test");
        emit_dispatch_evaluated("evt-test", "push", 1, 2);
    }
}
