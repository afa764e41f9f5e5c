use std::time::Duration;

use thiserror::Error;

use crate::types::JobId;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Job type must not be empty")]
    MissingJobType,

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Advisory lock for job {0} is not held by this connection")]
    LockNotHeld(JobId),

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Timed out waiting for a pooled connection")]
    PoolTimedOut,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker pool already started")]
    AlreadyStarted,

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Worker pool did not drain within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Errors a worker cannot recover from by pausing and polling again.
    ///
    /// These are escalated to the caller of the pool; everything else is
    /// logged and the worker keeps looping.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PoolClosed | Self::Config(_))
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::PoolTimedOut => Self::PoolTimedOut,
            other => Self::Store(other.to_string()),
        }
    }
}

/// Error returned by a job handler.
///
/// Every handler error takes the retry path: the job's error count is bumped,
/// the message is stored as its last error and the job is backed off.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct JobError {
    message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any displayable error
    pub fn from_display(err: impl std::fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("Failed to decode job args: {}", err))
    }
}
