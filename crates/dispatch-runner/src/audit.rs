//! Post-run audit of the job transitions recorded in the run ledger.

use std::collections::BTreeMap;

use dispatch_core::JobStatus;
use dispatch_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Ledger event kind written for every job state change.
pub const JOB_TRANSITION: &str = "job_transition";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub passed: bool,
    /// Empty when the audit passed.
    pub violations: Vec<String>,
    pub message: String,
}

pub struct RunAudit;

impl RunAudit {
    /// Replay the recorded transitions and check that:
    /// - sequence numbers strictly increase
    /// - every transition is legal from the job's previous state
    /// - every job that appears ends in a terminal state
    pub fn evaluate(events: &[RunEvent]) -> AuditVerdict {
        let mut violations = Vec::new();
        let mut last_seq: Option<u64> = None;
        let mut states: BTreeMap<String, JobStatus> = BTreeMap::new();

        for event in events {
            if let Some(prev) = last_seq {
                if event.seq <= prev {
                    violations.push(format!(
                        "event seq {} does not follow {}",
                        event.seq, prev
                    ));
                }
            }
            last_seq = Some(event.seq);

            if event.kind != JOB_TRANSITION {
                continue;
            }

            let job_id = event.payload["job_id"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            let from = parse_status(&event.payload["from"]);
            let to = parse_status(&event.payload["to"]);
            let (Some(from), Some(to)) = (from, to) else {
                violations.push(format!("job '{job_id}' has a malformed transition at seq {}", event.seq));
                continue;
            };

            let current = states.get(&job_id).copied().unwrap_or(JobStatus::Queued);
            if current != from {
                violations.push(format!(
                    "job '{job_id}' recorded {from} -> {to} while {current}"
                ));
            } else if !from.can_transition_to(to) {
                violations.push(format!("job '{job_id}' made illegal transition {from} -> {to}"));
            }
            states.insert(job_id, to);
        }

        for (job_id, status) in &states {
            if !status.is_terminal() {
                violations.push(format!("job '{job_id}' never finished (last state {status})"));
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("{} job(s) ran through legal transitions", states.len())
        } else {
            format!("audit failed with {} violation(s)", violations.len())
        };

        AuditVerdict {
            passed,
            violations,
            message,
        }
    }
}

fn parse_status(value: &serde_json::Value) -> Option<JobStatus> {
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn transition(seq: u64, job: &str, from: &str, to: &str) -> RunEvent {
        RunEvent {
            seq,
            kind: JOB_TRANSITION.to_string(),
            payload: json!({ "job_id": job, "from": from, "to": to, "attempt": 1 }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_events_pass() {
        assert!(RunAudit::evaluate(&[]).passed);
    }

    #[test]
    fn test_retry_cycle_passes() {
        let events = vec![
            transition(1, "ci:web:test", "queued", "running"),
            transition(2, "ci:web:test", "running", "retrying"),
            transition(3, "ci:web:test", "retrying", "running"),
            transition(4, "ci:web:test", "running", "succeeded"),
            transition(5, "ci:web:deploy", "queued", "skipped"),
        ];
        let verdict = RunAudit::evaluate(&events);
        assert!(verdict.passed, "{:?}", verdict.violations);
        assert_eq!(verdict.message, "2 job(s) ran through legal transitions");
    }

    #[test]
    fn test_illegal_transition_flagged() {
        let events = vec![transition(1, "ci:web:test", "queued", "succeeded")];
        let verdict = RunAudit::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("illegal transition queued -> succeeded"));
    }

    #[test]
    fn test_unfinished_job_flagged() {
        let events = vec![transition(1, "ci:web:build", "queued", "running")];
        let verdict = RunAudit::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never finished"));
    }

    #[test]
    fn test_out_of_order_seq_flagged() {
        let events = vec![
            transition(2, "ci:web:lint", "queued", "running"),
            transition(2, "ci:web:lint", "running", "succeeded"),
        ];
        let verdict = RunAudit::evaluate(&events);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("seq 2"));
    }

    #[test]
    fn test_state_mismatch_flagged() {
        let events = vec![
            transition(1, "ci:web:lint", "queued", "running"),
            transition(2, "ci:web:lint", "queued", "running"),
            transition(3, "ci:web:lint", "running", "succeeded"),
        ];
        let verdict = RunAudit::evaluate(&events);
        assert!(verdict.violations[0].contains("while running"));
    }
}
