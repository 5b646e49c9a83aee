//! Job failure classification and runner errors.

use dispatch_core::{GraphError, InvalidTransition};
use dispatch_state::StorageError;

/// Why a single job attempt failed.
///
/// `Transient` failures are retried with backoff; `Permanent` ones fail the
/// job immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(m) | JobError::Permanent(m) => m,
        }
    }
}

/// Failure to populate a build cache entry. Every waiter on the key
/// receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache populate failed for {key}: {reason}")]
pub struct CacheError {
    pub key: String,
    pub reason: String,
}

impl From<CacheError> for JobError {
    fn from(err: CacheError) -> Self {
        JobError::Transient(err.to_string())
    }
}

/// Errors that abort a whole run before or while scheduling jobs.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("job graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("state machine violation: {0}")]
    Transition(#[from] InvalidTransition),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("report io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_classification() {
        let t = JobError::transient("connection reset by peer");
        assert!(t.is_transient());
        assert_eq!(t.message(), "connection reset by peer");
        assert_eq!(t.to_string(), "transient: connection reset by peer");

        let p = JobError::permanent("assertion failed");
        assert!(!p.is_transient());
    }

    #[test]
    fn test_cache_error_retries_job() {
        let err: JobError = CacheError {
            key: "web/node/abc".to_string(),
            reason: "registry timeout".to_string(),
        }
        .into();
        assert!(err.is_transient());
        assert!(err.message().contains("web/node/abc"));
    }

    #[test]
    fn test_graph_error_converts() {
        let err: RunnerError = GraphError::NodeNotFound {
            id: "ci:web:build".to_string(),
        }
        .into();
        assert!(err.to_string().contains("ci:web:build"));
    }
}
