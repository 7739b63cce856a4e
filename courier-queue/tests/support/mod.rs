//! Scripted workers and helpers for driving a job queue in tests
#![allow(dead_code)] // Not every test file uses every helper
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::Priority;
use courier_queue::{
    CompletionHandle, JobError, JobQueue, QueueConfig, RetryPolicy, Worker, WorkerError, Work,
};
use courier_store::StoreConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reference to an outgoing message, as a sender would persist it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessage {
    pub message_id: u64,
    /// Block in the worker until the test opens the gate
    pub hold: bool,
}

impl SendMessage {
    pub const fn new(message_id: u64) -> Self {
        Self {
            message_id,
            hold: false,
        }
    }

    pub const fn held(message_id: u64) -> Self {
        Self {
            message_id,
            hold: true,
        }
    }
}

/// Message ids in the order the worker saw them
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<u64>>>);

impl Calls {
    pub fn ids(&self) -> Vec<u64> {
        self.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    fn record(&self, message_id: u64) -> usize {
        let mut calls = self.0.lock();
        calls.push(message_id);
        calls.len() - 1
    }
}

type Script = Box<dyn Fn(usize, &SendMessage) -> Result<(), WorkerError> + Send + Sync>;

/// A worker whose outcome for each attempt is decided by a script.
///
/// Items marked `hold` wait for a permit on the gate before the script runs.
pub struct ScriptedWorker {
    calls: Calls,
    gate: Arc<Semaphore>,
    script: Script,
}

impl ScriptedWorker {
    /// `script` receives the zero-based index of the attempt across all items
    pub fn new(
        script: impl Fn(usize, &SendMessage) -> Result<(), WorkerError> + Send + Sync + 'static,
    ) -> (Self, Calls, Arc<Semaphore>) {
        let calls = Calls::default();
        let gate = Arc::new(Semaphore::new(0));
        let worker = Self {
            calls: calls.clone(),
            gate: Arc::clone(&gate),
            script: Box::new(script),
        };
        (worker, calls, gate)
    }

    pub fn succeeding() -> (Self, Calls, Arc<Semaphore>) {
        Self::new(|_, _| Ok(()))
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    type Item = SendMessage;
    type Output = u64;

    async fn perform(&self, item: &SendMessage) -> Result<u64, WorkerError> {
        let attempt = self.calls.record(item.message_id);
        if item.hold {
            self.gate.acquire().await.expect("gate closed").forget();
        }
        (self.script)(attempt, item).map(|()| item.message_id)
    }
}

/// Backoff long enough that retries only happen when forced
pub fn manual_retries(max_retries: u32) -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
            jitter_factor: 0.0,
        },
        store: StoreConfig::Memory { capacity: None },
        shutdown_timeout_secs: 5,
    }
}

/// Backoff short enough for retry timers to fire during a test
pub fn fast_retries(max_retries: u32) -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 2,
            max_delay_ms: 20,
            jitter_factor: 0.0,
        },
        ..manual_retries(max_retries)
    }
}

/// Add `work` in its own transaction and commit it
pub async fn enqueue<W: Worker>(
    queue: &JobQueue<W>,
    work: Work<W::Item>,
) -> CompletionHandle<W::Output> {
    let mut tx = queue.store().begin();
    let handle = queue.add(work, &mut tx).await.expect("add");
    queue.store().commit(&mut tx).await.expect("commit");
    handle
}

pub async fn send<W: Worker<Item = SendMessage>>(
    queue: &JobQueue<W>,
    message: SendMessage,
    priority: Priority,
) -> CompletionHandle<W::Output> {
    enqueue(queue, Work::persisted(message).with_priority(priority)).await
}

pub async fn settle<O>(handle: CompletionHandle<O>) -> Result<O, JobError> {
    tokio::time::timeout(SETTLE_TIMEOUT, handle)
        .await
        .expect("handle did not settle in time")
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never became true");
}
