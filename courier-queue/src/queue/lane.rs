//! FIFO lanes of queued jobs
//!
//! A lane hands out one job at a time by [`Position`]. It also tracks
//! every job it owns (ready, executing, or waiting on a retry timer) so a
//! job can never be admitted twice while it is still in flight.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use courier_common::Priority;
use courier_store::JobRecordId;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{JobKey, TransientId, scheduler::Resume};

/// A transient job: the item itself, kept only in memory
#[derive(Debug)]
pub(crate) struct TransientJob<T> {
    pub(crate) id: TransientId,
    pub(crate) item: T,
    pub(crate) failure_count: u32,
}

#[derive(Debug)]
pub(crate) enum JobKind<T> {
    Persisted(JobRecordId),
    Transient(TransientJob<T>),
}

impl<T> JobKind<T> {
    pub(crate) const fn key(&self) -> JobKey {
        match self {
            Self::Persisted(id) => JobKey::Record(*id),
            Self::Transient(job) => JobKey::Transient(job.id),
        }
    }
}

/// Where a job sits in its lane.
///
/// Persisted jobs sort by their record's insertion order, whatever order
/// their transactions commit in. A transient job sorts behind the last
/// record inserted before it was added; transient jobs behind the same
/// record keep the order they were added in. Records always have a
/// `sequence` of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Position {
    insertion_order: u64,
    sequence: u64,
}

impl Position {
    /// A transient job's position, moved behind every record up to
    /// `insertion_order`. Records keep their own.
    #[must_use]
    pub(crate) fn behind(self, insertion_order: u64) -> Self {
        if self.sequence == 0 {
            return self;
        }
        Self {
            insertion_order: self.insertion_order.max(insertion_order),
            ..self
        }
    }
}

/// Hands out lane positions as work is added
#[derive(Debug, Default)]
pub(crate) struct Positions {
    last_insertion: AtomicU64,
    sequence: AtomicU64,
}

impl Positions {
    /// Position of the record with `insertion_order`
    pub(crate) fn persisted(&self, insertion_order: u64) -> Position {
        self.observe(insertion_order);
        Position {
            insertion_order,
            sequence: 0,
        }
    }

    pub(crate) fn transient(&self) -> Position {
        Position {
            insertion_order: self.last_insertion.load(Ordering::SeqCst),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Place later transient jobs behind records up to `insertion_order`
    pub(crate) fn observe(&self, insertion_order: u64) {
        self.last_insertion
            .fetch_max(insertion_order, Ordering::SeqCst);
    }
}

/// A job holding a position in a lane
#[derive(Debug)]
pub(crate) struct QueuedJob<T> {
    /// A retried job keeps the position it was first admitted at
    pub(crate) position: Position,
    pub(crate) kind: JobKind<T>,
}

impl<T> QueuedJob<T> {
    pub(crate) const fn key(&self) -> JobKey {
        self.kind.key()
    }
}

struct LaneState<T> {
    ready: BTreeMap<Position, QueuedJob<T>>,
    tracked: HashSet<JobKey>,
}

pub(crate) struct Lane<T> {
    priority: Priority,
    state: Mutex<LaneState<T>>,
    notify: Notify,
}

impl<T> Lane<T> {
    pub(crate) fn new(priority: Priority) -> Self {
        Self {
            priority,
            state: Mutex::new(LaneState {
                ready: BTreeMap::new(),
                tracked: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) const fn priority(&self) -> Priority {
        self.priority
    }

    /// Claim `kind` for this lane at `position` without making it ready.
    ///
    /// Returns `None` if the lane already owns that job.
    pub(crate) fn track(&self, position: Position, kind: JobKind<T>) -> Option<QueuedJob<T>> {
        if !self.state.lock().tracked.insert(kind.key()) {
            return None;
        }

        Some(QueuedJob { position, kind })
    }

    /// Track `kind` and queue it for execution at `position`.
    ///
    /// Returns `false` if the lane already owns that job.
    pub(crate) fn admit(&self, position: Position, kind: JobKind<T>) -> bool {
        self.track(position, kind)
            .map(|job| self.requeue(job))
            .is_some()
    }

    /// Queue an already tracked job at its original position
    pub(crate) fn requeue(&self, job: QueuedJob<T>) {
        self.state.lock().ready.insert(job.position, job);
        self.notify.notify_one();
    }

    /// Take the earliest ready job
    pub(crate) fn pop(&self) -> Option<QueuedJob<T>> {
        self.state
            .lock()
            .ready
            .pop_first()
            .map(|(_, job)| job)
    }

    /// Forget a job that has settled
    pub(crate) fn release(&self, key: &JobKey) {
        self.state.lock().tracked.remove(key);
    }

    /// Wait until a job may be ready
    pub(crate) async fn ready(&self) {
        self.notify.notified().await;
    }

    /// Drop every queued job, returning the keys the lane owned
    pub(crate) fn clear(&self) -> Vec<JobKey> {
        let mut state = self.state.lock();
        state.ready.clear();
        state.tracked.drain().collect()
    }

    /// Number of jobs ready to run
    pub(crate) fn len(&self) -> usize {
        self.state.lock().ready.len()
    }
}

/// A queued job waiting on a retry timer, with the lane it goes back to
pub(crate) struct Retry<T> {
    pub(crate) lane: Arc<Lane<T>>,
    pub(crate) job: QueuedJob<T>,
}

impl<T: Send + 'static> Resume for Retry<T> {
    fn key(&self) -> JobKey {
        self.job.key()
    }

    fn resume(self) {
        self.lane.requeue(self.job);
    }
}

/// One lane per priority
pub(crate) struct Lanes<T> {
    high: Arc<Lane<T>>,
    normal: Arc<Lane<T>>,
}

impl<T> Default for Lanes<T> {
    fn default() -> Self {
        Self {
            high: Arc::new(Lane::new(Priority::High)),
            normal: Arc::new(Lane::new(Priority::Normal)),
        }
    }
}

impl<T> Lanes<T> {
    pub(crate) const fn get(&self, priority: Priority) -> &Arc<Lane<T>> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Lane<T>>> {
        Priority::ALL.into_iter().map(|priority| self.get(priority))
    }
}
