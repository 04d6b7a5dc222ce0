//! Error types for queue operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Backing store fault that did not come from the redis client
    #[error("Store error: {0}")]
    Store(String),

    /// A stored record could not be decoded
    #[error("Corrupt job record ({reason}): {record}")]
    CorruptRecord {
        /// The raw string as read from the store
        record: String,
        /// Why decoding failed
        reason: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Job options rejected before enqueue
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Job execution failed
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job was delivered more times than it allows
    #[error("Job exceeded its attempt limit ({attempts} of {max_attempts})")]
    AttemptsExceeded {
        /// Deliveries before this one
        attempts: u32,
        /// The job's delivery limit
        max_attempts: u32,
    },

    /// No handler registered for job name
    #[error("No handler registered for job: {0}")]
    NoHandler(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error
    #[error("Operation timeout")]
    Timeout,
}

impl QueueError {
    /// Build a corrupt-record error for `record`.
    pub fn corrupt(record: impl Into<String>, reason: impl ToString) -> Self {
        Self::CorruptRecord {
            record: record.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is a persistence-layer fault.
    ///
    /// These must never be read as "queue empty".
    pub fn is_store_fault(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Store(_))
    }

    /// Whether the error came from a record that failed to decode.
    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. })
    }
}
