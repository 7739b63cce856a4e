use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::WorkerError;

/// Performs the actual work behind a queued job, e.g. sending a message.
///
/// The queue reconstructs `Item` from the persisted record before every
/// attempt, so an item should be a reference to the work (a row id plus the
/// flags needed to re-run it) rather than the content itself.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Item: Serialize + DeserializeOwned + Debug + Send + Sync + 'static;
    type Output: Send + 'static;

    /// Make one attempt at `item`.
    ///
    /// # Errors
    /// Any failure of the attempt. The queue classifies it to decide between
    /// retrying and giving up.
    async fn perform(&self, item: &Self::Item) -> Result<Self::Output, WorkerError>;
}
