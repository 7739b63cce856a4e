//! Typed error handling for the job queue.
//!
//! Worker errors form a closed set so the classifier can match on them
//! exhaustively:
//! - Retryable failures (network, timeouts) - retried with backoff
//! - Permanent failures (authorisation, validation) - never retried
//! - Unrecognized failures - treated as permanent by default

use courier_store::{SerializationError, StoreError};
use thiserror::Error;

/// Error raised by a [`Worker`](crate::Worker) attempt.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transient condition; another attempt may succeed.
    #[error("Retryable failure: {0}")]
    Retryable(#[from] RetryableError),

    /// The work can never succeed as submitted.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// An error kind the queue knows nothing about.
    #[error("Unrecognized failure: {0}")]
    Unrecognized(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors worth another attempt after a backoff.
#[derive(Debug, Error)]
pub enum RetryableError {
    /// The remote end could not be reached.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The attempt did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote service reported itself unavailable.
    #[error("Service unavailable: {0}")]
    ServerUnavailable(String),

    /// The remote service asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

/// Errors that no number of attempts will fix.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The work item failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The remote service refused the work outright.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The work item is inconsistent with the state it refers to.
    #[error("Logical error: {0}")]
    Logical(String),
}

impl WorkerError {
    /// Wrap an arbitrary error the queue has no classification for.
    pub fn unrecognized(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unrecognized(error.into())
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// The reason a [`CompletionHandle`](crate::CompletionHandle) rejected.
#[derive(Debug, Error)]
pub enum JobError {
    /// The worker raised an error classified as permanent.
    #[error("Job failed permanently: {0}")]
    Permanent(WorkerError),

    /// Retryable failures pushed the failure count past the retry limit.
    #[error("Job gave up after {failure_count} failures, last error: {last_error}")]
    RetriesExhausted {
        failure_count: u32,
        last_error: WorkerError,
    },

    /// The persisted record could not be turned back into a work item.
    #[error("Job record is malformed: {0}")]
    Malformed(String),

    /// The store failed while dispatching; the record keeps its last
    /// committed state and is picked up again on the next set up.
    #[error("Store error during dispatch: {0}")]
    Store(#[from] StoreError),

    /// The job was dropped without settling: its transaction rolled back,
    /// its record vanished, or the queue shut down first.
    #[error("Job was abandoned before it settled")]
    Abandoned,
}

impl JobError {
    /// The last error the worker raised, if the job got that far.
    #[must_use]
    pub const fn worker_error(&self) -> Option<&WorkerError> {
        match self {
            Self::Permanent(error) | Self::RetriesExhausted { last_error: error, .. } => {
                Some(error)
            }
            Self::Malformed(_) | Self::Store(_) | Self::Abandoned => None,
        }
    }
}

/// Errors from the queue's own API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to encode work item: {0}")]
    Encode(#[from] SerializationError),

    #[error("Job queue has been shut down")]
    AlreadyShutDown,
}
