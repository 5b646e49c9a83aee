//! Storage trait definitions for the dispatch engine
//!
//! These traits define the persistence seams:
//! - `LogStore`: Content-addressed job log storage (put/get by digest)
//! - `RunLedger`: Pipeline run persistence (job transitions, summaries)
//! - `DecisionLog`: Append-only audit log of dispatch decisions
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module, file-backed implementations via `fs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// LogStore: Content-Addressed Job Logs
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed store for job logs.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// RunLedger: Pipeline Run Persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Event the run was dispatched for
    pub event_id: String,
    /// Git ref the event targeted (used for supersede bookkeeping)
    pub git_ref: String,
    /// Who triggered the event
    pub actor: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "job_transition", "job_finished")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Number of jobs in the run
    pub total_jobs: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether every pipeline in the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by monotonic `seq` within a run.
/// - A run transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run, returning its unique ID.
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as cancelled.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// List runs, optionally filtered by git ref.
    async fn list_runs(&self, git_ref: Option<&str>) -> StorageResult<Vec<RunRecord>>;
}

// ---------------------------------------------------------------------------
// DecisionLog: Dispatch Audit
// ---------------------------------------------------------------------------

/// One audited dispatch decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    /// Event the decision was produced for
    pub event_id: String,
    /// SHA-256 of the canonical decision JSON
    pub decision_digest: ContentDigest,
    /// The decision itself
    pub decision: serde_json::Value,
    /// Reasoning trail captured at evaluation time
    pub trail: serde_json::Value,
    /// When the record was appended
    pub recorded_at: DateTime<Utc>,
}

/// Append-only log of dispatch decisions.
///
/// Re-recording the same event is allowed; history is never rewritten.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Append a record.
    async fn append(&self, record: DecisionRecord) -> StorageResult<()>;

    /// All records for an event, oldest first.
    async fn find(&self, event_id: &str) -> StorageResult<Vec<DecisionRecord>>;

    /// Every record, oldest first.
    async fn list(&self) -> StorageResult<Vec<DecisionRecord>>;
}
