//! Completion handles: the bridge between `add` and the lane that eventually
//! runs the job.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::JobKey;
use crate::error::JobError;

type Outcome<O> = Result<O, JobError>;

/// Settles once with the job's output, or with the reason it will never
/// produce one.
///
/// Handles live in memory only. A job recovered after a restart still runs
/// to completion, but nobody from before the restart is told about it.
pub struct CompletionHandle<O> {
    key: JobKey,
    receiver: oneshot::Receiver<Outcome<O>>,
}

impl<O> fmt::Debug for CompletionHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<O> CompletionHandle<O> {
    /// The job this handle reports on
    pub const fn key(&self) -> JobKey {
        self.key
    }

    /// Wait for the job to settle
    ///
    /// # Errors
    /// The [`JobError`] the job was rejected with
    pub async fn wait(self) -> Outcome<O> {
        self.await
    }
}

impl<O> Future for CompletionHandle<O> {
    type Output = Outcome<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Abandoned)))
    }
}

/// Pending completion senders, keyed by job
pub(crate) struct Completions<O> {
    senders: DashMap<JobKey, oneshot::Sender<Outcome<O>>>,
}

impl<O> Default for Completions<O> {
    fn default() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }
}

impl<O> Completions<O> {
    pub(crate) fn register(&self, key: JobKey) -> CompletionHandle<O> {
        let (sender, receiver) = oneshot::channel();
        self.senders.insert(key, sender);
        CompletionHandle { key, receiver }
    }

    /// Settle the handle for `key`, if anyone is still listening
    pub(crate) fn settle(&self, key: &JobKey, outcome: Outcome<O>) {
        if let Some((_, sender)) = self.senders.remove(key) {
            let _ = sender.send(outcome);
        }
    }

    /// Drop the sender for `key`, so its handle resolves to [`JobError::Abandoned`]
    pub(crate) fn abandon(&self, key: &JobKey) {
        self.senders.remove(key);
    }

    pub(crate) fn clear(&self) {
        self.senders.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
