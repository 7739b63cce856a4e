//! Failure classification

use crate::error::WorkerError;

/// What the queue should do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retryable,
    Permanent,
}

/// Decides whether a worker error is worth retrying.
///
/// Implementations must be pure: the same error always yields the same
/// verdict, and classifying has no side effects.
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    fn classify(&self, error: &WorkerError) -> Verdict;
}

/// Classifies by error variant; unrecognized errors are never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, error: &WorkerError) -> Verdict {
        match error {
            WorkerError::Retryable(_) => Verdict::Retryable,
            WorkerError::Permanent(_) | WorkerError::Unrecognized(_) => Verdict::Permanent,
        }
    }
}
