//! Tracks in-flight runs per git ref and applies the supersede policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use dispatch_core::obs::emit_run_superseded;
use dispatch_core::{DispatchDecision, Event, SupersedePolicy, METRICS};
use tokio::sync::watch;

use crate::error::RunnerResult;
use crate::report::RunReport;
use crate::runner::PipelineRunner;

struct ActiveRun {
    token: u64,
    event_id: String,
    cancel: watch::Sender<bool>,
}

/// Handle for one registered run. Pass `cancel` to
/// [`PipelineRunner::run`] and hand the ticket back to
/// [`RunSupervisor::finish`] when the run ends.
#[derive(Debug)]
pub struct RunTicket {
    token: u64,
    git_ref: String,
    pub cancel: watch::Receiver<bool>,
}

impl RunTicket {
    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }
}

pub struct RunSupervisor {
    policy: SupersedePolicy,
    next_token: AtomicU64,
    active: Mutex<HashMap<String, Vec<ActiveRun>>>,
}

impl RunSupervisor {
    pub fn new(policy: SupersedePolicy) -> Self {
        Self {
            policy,
            next_token: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> SupersedePolicy {
        self.policy
    }

    /// Register a run for `event`. Under [`SupersedePolicy::Cancel`] every
    /// run already active on the same ref is signalled to cancel.
    pub fn begin(&self, event: &Event) -> RunTicket {
        let (tx, rx) = watch::channel(false);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let git_ref = event.git_ref().to_string();

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let runs = active.entry(git_ref.clone()).or_default();
        if self.policy == SupersedePolicy::Cancel {
            for stale in runs.drain(..) {
                let _ = stale.cancel.send(true);
                emit_run_superseded(&git_ref, &stale.event_id, event.id());
                METRICS.inc_superseded();
            }
        }
        runs.push(ActiveRun {
            token,
            event_id: event.id().to_string(),
            cancel: tx,
        });

        RunTicket {
            token,
            git_ref,
            cancel: rx,
        }
    }

    /// Forget the run behind `ticket`. A superseded run is already gone.
    pub fn finish(&self, ticket: &RunTicket) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runs) = active.get_mut(&ticket.git_ref) {
            runs.retain(|run| run.token != ticket.token);
            if runs.is_empty() {
                active.remove(&ticket.git_ref);
            }
        }
    }

    /// Number of runs currently registered for `git_ref`.
    pub fn active_runs(&self, git_ref: &str) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(git_ref)
            .map_or(0, Vec::len)
    }

    /// Register, run and deregister in one call.
    pub async fn run(
        &self,
        runner: &PipelineRunner,
        event: &Event,
        decision: &DispatchDecision,
    ) -> RunnerResult<RunReport> {
        let ticket = self.begin(event);
        let result = runner.run(event, decision, ticket.cancel.clone()).await;
        self.finish(&ticket);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(sha: &str) -> Event {
        Event::from_json(&format!(
            r#"{{"id":"evt-{sha}","type":"push","ref":"refs/heads/main","changed_files":["a"],"actor":"dev","timestamp":"2026-03-01T00:00:00Z"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_new_run_cancels_stale_one() {
        let supervisor = RunSupervisor::new(SupersedePolicy::Cancel);
        let first = supervisor.begin(&push("a1"));
        assert!(!*first.cancel.borrow());

        let second = supervisor.begin(&push("b2"));
        assert!(*first.cancel.borrow());
        assert!(!*second.cancel.borrow());
        assert_eq!(supervisor.active_runs("refs/heads/main"), 1);

        supervisor.finish(&first);
        assert_eq!(supervisor.active_runs("refs/heads/main"), 1);
        supervisor.finish(&second);
        assert_eq!(supervisor.active_runs("refs/heads/main"), 0);
    }

    #[test]
    fn test_parallel_policy_keeps_both() {
        let supervisor = RunSupervisor::new(SupersedePolicy::AllowParallel);
        let first = supervisor.begin(&push("a1"));
        let _second = supervisor.begin(&push("b2"));
        assert!(!*first.cancel.borrow());
        assert_eq!(supervisor.active_runs("refs/heads/main"), 2);
    }

    #[test]
    fn test_other_refs_untouched() {
        let supervisor = RunSupervisor::new(SupersedePolicy::Cancel);
        let main = supervisor.begin(&push("a1"));
        let release = Event::from_json(
            r#"{"type":"push","ref":"refs/heads/release","changed_files":["a"],"actor":"dev","timestamp":"2026-03-01T00:00:00Z"}"#,
        )
        .unwrap();
        let other = supervisor.begin(&release);
        assert!(!*main.cancel.borrow());
        assert_eq!(other.git_ref(), "refs/heads/release");
    }
}
