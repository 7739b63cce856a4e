//! A durable asynchronous job queue.
//!
//! Jobs are enqueued inside the caller's store transaction, executed one at a
//! time per priority lane by a [`Worker`], retried with exponential backoff
//! while their failures are classified as retryable, and reported back
//! through a [`CompletionHandle`].

pub mod classifier;
pub mod config;
pub mod error;
pub mod policy;
pub mod queue;
pub mod worker;

pub use classifier::{DefaultClassifier, FailureClassifier, Verdict};
pub use config::QueueConfig;
pub use error::{JobError, PermanentError, QueueError, RetryableError, WorkerError};
pub use policy::RetryPolicy;
pub use queue::{CompletionHandle, JobKey, JobQueue, TransientId, Work};
pub use worker::Worker;
