//! In-memory implementations of the storage traits
//!
//! `MemoryLogStore`, `MemoryRunLedger` and `MemoryDecisionLog` satisfy the
//! trait contracts without touching the filesystem. The CLI uses them for
//! `--dry-run`; tests use them everywhere.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryLogStore
// ---------------------------------------------------------------------------

/// In-memory log store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = self.store.lock().unwrap();
        store.insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = self.store.lock().unwrap();
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = self.store.lock().unwrap();
        Ok(store.contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn finalize(
        &self,
        run_id: &RunId,
        summary: RunSummary,
        status: RunStatus,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        if state.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", state.record.status),
                expected: "Running".to_string(),
            });
        }
        state.events.push(event);
        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finalize(run_id, summary, RunStatus::Completed)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finalize(run_id, summary, RunStatus::Failed)
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finalize(run_id, summary, RunStatus::Cancelled)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        let state = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_runs(&self, git_ref: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| git_ref.map(|r| s.record.metadata.git_ref == r).unwrap_or(true))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryDecisionLog
// ---------------------------------------------------------------------------

/// In-memory append-only decision log.
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of appended records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DecisionLog for MemoryDecisionLog {
    async fn append(&self, record: DecisionRecord) -> StorageResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn find(&self, event_id: &str) -> StorageResult<Vec<DecisionRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn list(&self) -> StorageResult<Vec<DecisionRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }
}
