//! Error types for the ember reflection manager.
//!
//! All fallible operations in the crate return [`Result`]. The error
//! taxonomy mirrors how faults are handled by the reconciliation loop:
//! concurrent store modifications are skipped and retried on the next
//! wakeup, missing referents are hard faults for the affected reflection,
//! and everything else is contained per item.

use thiserror::Error;

/// The primary error type for ember operations.
#[derive(Error, Debug)]
pub enum EmberError {
    /// A stale record was written back to a store.
    #[error("concurrent modification of {entity}")]
    ConcurrentModification { entity: String },

    /// A job that must exist could not be found.
    #[error("job {job_id} not found")]
    JobNotFound { job_id: String },

    /// Store-level error (encoding, missing row on a required read, ...).
    #[error("store error: {message}")]
    Store { message: String },

    /// Job service error (submission rejected, cancel failed, ...).
    #[error("job error: {message}")]
    Job { message: String },

    /// Namespace lookup error.
    #[error("namespace error: {message}")]
    Namespace { message: String },

    /// An entity was observed in a state the state machine forbids.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Internal error (bug in the manager).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EmberError {
    /// Create a concurrent-modification error for the named entity.
    pub fn concurrent_modification(entity: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            entity: entity.into(),
        }
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::JobNotFound {
            job_id: job_id.into(),
        }
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a job error.
    pub fn job(message: impl Into<String>) -> Self {
        Self::Job {
            message: message.into(),
        }
    }

    /// Create a namespace error.
    pub fn namespace(message: impl Into<String>) -> Self {
        Self::Namespace {
            message: message.into(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is a transient store conflict that the caller
    /// should skip and retry on the next wakeup.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Whether this error reports a missing job.
    pub fn is_job_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound { .. })
    }
}

impl From<serde_json::Error> for EmberError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Result type alias for ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmberError::concurrent_modification("reflection goal abc");
        assert_eq!(
            err.to_string(),
            "concurrent modification of reflection goal abc"
        );

        let err = EmberError::job_not_found("j-123");
        assert_eq!(err.to_string(), "job j-123 not found");
    }

    #[test]
    fn test_error_predicates() {
        assert!(EmberError::concurrent_modification("x").is_concurrent_modification());
        assert!(!EmberError::store("x").is_concurrent_modification());
        assert!(EmberError::job_not_found("j").is_job_not_found());
        assert!(!EmberError::internal("j").is_job_not_found());
    }
}
