//! dispatch-state: audit and log persistence for the dispatch engine
//!
//! ## Key Components
//!
//! - `RunLedger`: pipeline runs and the job transitions recorded during them
//! - `DecisionLog`: append-only audit of every dispatch decision
//! - `LogStore`: content-addressed job logs (`logs_ref` in run results)
//!
//! In-memory implementations live in [`fakes`], file-backed ones in [`fs`].

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::{FsLogStore, JsonlDecisionLog, JsonlRunLedger};
pub use storage_traits::{
    ContentDigest, DecisionLog, DecisionRecord, LogStore, RunEvent, RunId, RunLedger,
    RunMetadata, RunRecord, RunStatus, RunSummary, StorageResult,
};
