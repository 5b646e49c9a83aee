//! Trait contract tests for LogStore, RunLedger, and DecisionLog.
//!
//! These tests verify the behavioral contracts of the storage traits
//! using in-memory fakes. Any conforming implementation must pass these.

use chrono::Utc;
use dispatch_state::fakes::{MemoryDecisionLog, MemoryLogStore, MemoryRunLedger};
use dispatch_state::storage_traits::*;
use dispatch_state::StorageError;
use serde_json::json;

fn metadata(git_ref: &str) -> RunMetadata {
    RunMetadata {
        event_id: "evt-1".to_string(),
        git_ref: git_ref.to_string(),
        actor: "octocat".to_string(),
        tags: json!({ "pipelines": ["ci"] }),
    }
}

fn summary(success: bool) -> RunSummary {
    RunSummary {
        total_events: 2,
        total_jobs: 1,
        duration_ms: 100,
        success,
    }
}

fn event(seq: u64) -> RunEvent {
    RunEvent {
        seq,
        kind: "job_transition".to_string(),
        payload: json!({ "seq": seq }),
        timestamp: Utc::now(),
    }
}

// ===========================================================================
// LogStore contract tests
// ===========================================================================

#[tokio::test]
async fn log_put_returns_correct_digest() {
    let store = MemoryLogStore::new();
    let data = b"npm test: 42 passing";
    let digest = store.put(data).await.unwrap();

    assert_eq!(digest, ContentDigest::from_bytes(data));
}

#[tokio::test]
async fn log_get_round_trip() {
    let store = MemoryLogStore::new();
    let digest = store.put(b"round trip log").await.unwrap();

    assert_eq!(store.get(&digest).await.unwrap(), b"round trip log");
}

#[tokio::test]
async fn log_get_not_found() {
    let store = MemoryLogStore::new();
    let bogus = ContentDigest::from_bytes(b"never stored");
    let err = store.get(&bogus).await.unwrap_err();

    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn log_contains_tracks_puts() {
    let store = MemoryLogStore::new();
    let digest = store.put(b"present").await.unwrap();

    assert!(store.contains(&digest).await.unwrap());
    assert!(!store
        .contains(&ContentDigest::from_bytes(b"absent"))
        .await
        .unwrap());
}

// ===========================================================================
// RunLedger contract tests
// ===========================================================================

#[tokio::test]
async fn ledger_create_run_starts_running() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    let run = ledger.get_run(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Running);
    assert!(run.summary.is_none());
    assert!(run.completed_at.is_none());
}

#[tokio::test]
async fn ledger_events_ordered_by_seq() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    ledger.append_event(&run_id, event(2)).await.unwrap();
    ledger.append_event(&run_id, event(1)).await.unwrap();

    let events = ledger.get_events(&run_id).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn ledger_terminal_runs_are_immutable() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    ledger.fail_run(&run_id, summary(false)).await.unwrap();

    let err = ledger.append_event(&run_id, event(1)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));

    let err = ledger.complete_run(&run_id, summary(true)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidRunState { .. }));
}

#[tokio::test]
async fn ledger_cancel_run_records_status() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    ledger.cancel_run(&run_id, summary(false)).await.unwrap();

    let run = ledger.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn ledger_unknown_run_not_found() {
    let ledger = MemoryRunLedger::new();
    let err = ledger.get_run(&RunId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

#[tokio::test]
async fn ledger_list_runs_filters_by_ref() {
    let ledger = MemoryRunLedger::new();
    ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    ledger.create_run(metadata("refs/heads/main")).await.unwrap();
    ledger.create_run(metadata("refs/heads/feature")).await.unwrap();

    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 3);
    assert_eq!(
        ledger.list_runs(Some("refs/heads/main")).await.unwrap().len(),
        2
    );
}

// ===========================================================================
// DecisionLog contract tests
// ===========================================================================

fn decision_record(event_id: &str) -> DecisionRecord {
    let decision = json!({ "event_id": event_id, "pipelines": [{ "id": "ci" }] });
    DecisionRecord {
        event_id: event_id.to_string(),
        decision_digest: ContentDigest::from_bytes(decision.to_string().as_bytes()),
        decision,
        trail: json!([]),
        recorded_at: Utc::now(),
    }
}

#[tokio::test]
async fn decision_log_is_append_only() {
    let log = MemoryDecisionLog::new();
    log.append(decision_record("evt-a")).await.unwrap();
    log.append(decision_record("evt-a")).await.unwrap();
    log.append(decision_record("evt-b")).await.unwrap();

    assert_eq!(log.len(), 3);
    let a = log.find("evt-a").await.unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!(a[0].decision_digest, a[1].decision_digest);
}
