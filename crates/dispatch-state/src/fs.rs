//! File-backed storage implementations.
//!
//! - [`FsLogStore`]: job logs under `<root>/objects/<2 hex>/<62 hex>`.
//! - [`JsonlDecisionLog`]: one JSON line per audited decision.
//! - [`JsonlRunLedger`]: in-memory ledger that mirrors every mutation into a
//!   JSON-lines journal so a run can be inspected after the process exits.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::fakes::MemoryRunLedger;
use crate::storage_traits::*;

/// Append one serialized line to `path`, creating parent directories.
async fn append_line<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// FsLogStore
// ---------------------------------------------------------------------------

/// Filesystem-backed log store with git-style 2-char sharding.
pub struct FsLogStore {
    objects_dir: PathBuf,
}

impl FsLogStore {
    /// Create a store rooted at `root`. Creates `root/objects/` if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let objects_dir = root.as_ref().join("objects");
        tokio::fs::create_dir_all(&objects_dir).await?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);
        if tokio::fs::try_exists(&path).await? {
            return Ok(digest);
        }

        let shard_dir = self.objects_dir.join(&digest.as_str()[..2]);
        tokio::fs::create_dir_all(&shard_dir).await?;

        // Write to a unique temp name in the same shard, then rename.
        let tmp = shard_dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(digest = %digest.short(), bytes = data.len(), "log blob written");
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    digest: digest.as_str().to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }
}

// ---------------------------------------------------------------------------
// JsonlDecisionLog
// ---------------------------------------------------------------------------

/// Append-only decision log stored as JSON lines.
pub struct JsonlDecisionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlDecisionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> StorageResult<Vec<DecisionRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl DecisionLog for JsonlDecisionLog {
    async fn append(&self, record: DecisionRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.path, &record).await?;
        debug!(event_id = %record.event_id, path = %self.path.display(), "decision appended");
        Ok(())
    }

    async fn find(&self, event_id: &str) -> StorageResult<Vec<DecisionRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.event_id == event_id)
            .collect())
    }

    async fn list(&self) -> StorageResult<Vec<DecisionRecord>> {
        self.read_all().await
    }
}

// ---------------------------------------------------------------------------
// JsonlRunLedger
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct JournalEntry<'a, T: Serialize> {
    op: &'a str,
    run_id: &'a RunId,
    at: chrono::DateTime<Utc>,
    body: &'a T,
}

/// Run ledger that keeps state in memory and journals every mutation.
pub struct JsonlRunLedger {
    inner: MemoryRunLedger,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRunLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: MemoryRunLedger::new(),
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn journal<T: Serialize + Sync>(
        &self,
        op: &str,
        run_id: &RunId,
        body: &T,
    ) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let entry = JournalEntry {
            op,
            run_id,
            at: Utc::now(),
            body,
        };
        append_line(&self.path, &entry).await?;
        debug!(op, run_id = %run_id.0, "run ledger journaled");
        Ok(())
    }
}

#[async_trait]
impl RunLedger for JsonlRunLedger {
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId> {
        let run_id = self.inner.create_run(metadata.clone()).await?;
        self.journal("create_run", &run_id, &metadata).await?;
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.inner.append_event(run_id, event.clone()).await?;
        self.journal("append_event", run_id, &event).await
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.complete_run(run_id, summary.clone()).await?;
        self.journal("complete_run", run_id, &summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.fail_run(run_id, summary.clone()).await?;
        self.journal("fail_run", run_id, &summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.inner.cancel_run(run_id, summary.clone()).await?;
        self.journal("cancel_run", run_id, &summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.inner.get_run(run_id).await
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.inner.get_events(run_id).await
    }

    async fn list_runs(&self, git_ref: Option<&str>) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(git_ref).await
    }
}
