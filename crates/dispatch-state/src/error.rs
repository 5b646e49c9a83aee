//! Error types for dispatch-state

use thiserror::Error;

/// Errors raised by the storage traits and their implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Blob not present in the log store
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Digest string is not 64 hex characters
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Run id unknown to the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Mutation attempted on a run that already reached a terminal state
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
