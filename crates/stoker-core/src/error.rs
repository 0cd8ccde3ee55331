use thiserror::Error;

use crate::domain::ExceptionInfo;

#[derive(Debug, Error)]
pub enum StokerError {
    /// Invalid filter configuration, rejected at setter time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A filter raised during election or application.
    #[error("filter raised {}: {}", .0.exception_type, .0.message)]
    Filter(ExceptionInfo),

    /// Transient storage failure; the caller retries the whole
    /// election + application with refreshed job data.
    #[error("storage error: {0}")]
    Storage(String),

    /// A job parameter could not be decoded.
    #[error("malformed value for parameter {name}: {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Permanent storage inconsistency (missing job, unknown state).
    /// Propagated up; never retried.
    #[error("fatal storage inconsistency: {0}")]
    Fatal(String),

    /// The transition was canceled before commit; nothing was written.
    #[error("transition canceled before commit")]
    Canceled,
}

impl StokerError {
    /// Build a filter fault carrying an explicit exception type, so that
    /// allow/deny lists downstream can match on it.
    pub fn filter(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        StokerError::Filter(ExceptionInfo::new(exception_type, message))
    }
}
