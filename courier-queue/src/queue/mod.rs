//! The job queue
//!
//! Work enters through [`JobQueue::add`] inside the caller's transaction and
//! is admitted to its lane only once that transaction commits. Each lane runs
//! its jobs one at a time in insertion order, whatever order the enqueueing
//! transactions commit in; a failed job either waits out a backoff in the
//! retry scheduler or settles for good.

mod completion;
mod dispatch;
mod lane;
mod scheduler;

use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_common::{JobStatus, Priority, Signal, internal};
use courier_store::{JobRecord, JobRecordId, JobRecordStore, StoreError, Transaction, types::now_ms};
use courier_tracing::traced;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinSet};

pub use self::completion::CompletionHandle;
use self::{
    completion::Completions,
    lane::{JobKind, Lanes, Position, Positions, Retry, TransientJob},
    scheduler::{Resume, RetryScheduler},
};
use crate::{
    classifier::{DefaultClassifier, FailureClassifier},
    config::QueueConfig,
    error::QueueError,
    policy::RetryPolicy,
    worker::Worker,
};

static NEXT_TRANSIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a transient job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransientId(u64);

impl TransientId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TRANSIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transient-{}", self.0)
    }
}

/// Identity of a queued job, persisted or not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKey {
    Record(JobRecordId),
    Transient(TransientId),
}

impl JobKey {
    /// The backing record, for persisted jobs
    pub const fn record_id(&self) -> Option<JobRecordId> {
        match self {
            Self::Record(id) => Some(*id),
            Self::Transient(_) => None,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(id) => id.fmt(f),
            Self::Transient(id) => id.fmt(f),
        }
    }
}

/// A unit of work to enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work<T> {
    /// Written to the store with the caller's transaction; survives restarts
    Persisted { item: T, priority: Priority },
    /// Kept in memory only; lost on restart
    Transient { item: T, priority: Priority },
}

impl<T> Work<T> {
    pub const fn persisted(item: T) -> Self {
        Self::Persisted {
            item,
            priority: Priority::Normal,
        }
    }

    pub const fn transient(item: T) -> Self {
        Self::Transient {
            item,
            priority: Priority::Normal,
        }
    }

    #[must_use]
    pub fn with_priority(self, priority: Priority) -> Self {
        match self {
            Self::Persisted { item, .. } => Self::Persisted { item, priority },
            Self::Transient { item, .. } => Self::Transient { item, priority },
        }
    }

    pub const fn priority(&self) -> Priority {
        match self {
            Self::Persisted { priority, .. } | Self::Transient { priority, .. } => *priority,
        }
    }
}

/// Work committed but not yet handed to a lane
type Admission<T> = (Priority, Position, JobKind<T>);

/// Lifecycle of a queue. Work committed before the lanes run is held back
/// so that recovered records go first.
enum Phase<T> {
    Idle(Vec<Admission<T>>),
    Loading(Vec<Admission<T>>),
    Running,
    ShutDown,
}

struct Inner<W: Worker> {
    worker: W,
    store: Arc<dyn JobRecordStore>,
    classifier: Arc<dyn FailureClassifier>,
    policy: RetryPolicy,
    shutdown_timeout: Duration,
    lanes: Lanes<W::Item>,
    positions: Positions,
    scheduler: RetryScheduler<Retry<W::Item>>,
    completions: Completions<W::Output>,
    phase: Mutex<Phase<W::Item>>,
    shutdown: broadcast::Sender<Signal>,
    tasks: Mutex<JoinSet<()>>,
}

/// A durable job queue with one sequential lane per [`Priority`].
pub struct JobQueue<W: Worker> {
    inner: Arc<Inner<W>>,
}

impl<W: Worker> Clone for JobQueue<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Worker> fmt::Debug for JobQueue<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.inner.store)
            .field("classifier", &self.inner.classifier)
            .field("policy", &self.inner.policy)
            .field("pending_retries", &self.inner.scheduler.len())
            .field("unsettled", &self.inner.completions.len())
            .finish_non_exhaustive()
    }
}

impl<W: Worker> JobQueue<W> {
    pub fn new(worker: W, store: Arc<dyn JobRecordStore>, config: &QueueConfig) -> Self {
        Self::with_classifier(worker, store, config, DefaultClassifier)
    }

    pub fn with_classifier(
        worker: W,
        store: Arc<dyn JobRecordStore>,
        config: &QueueConfig,
        classifier: impl FailureClassifier + 'static,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(4);

        Self {
            inner: Arc::new(Inner {
                worker,
                store,
                classifier: Arc::new(classifier),
                policy: config.retry.clone(),
                shutdown_timeout: config.shutdown_timeout(),
                lanes: Lanes::default(),
                positions: Positions::default(),
                scheduler: RetryScheduler::default(),
                completions: Completions::default(),
                phase: Mutex::new(Phase::Idle(Vec::new())),
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Open the store named by `config` and build a queue over it
    ///
    /// # Errors
    /// If the store cannot be opened
    pub async fn from_config(worker: W, config: QueueConfig) -> Result<Self, QueueError> {
        let store = config.store.clone().into_store().await?;
        Ok(Self::new(worker, store, &config))
    }

    /// The store backing this queue; callers begin their transactions here
    pub fn store(&self) -> &Arc<dyn JobRecordStore> {
        &self.inner.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.phase.lock(), Phase::Running)
    }

    /// Enqueue `work` as part of `tx`.
    ///
    /// Persisted work is inserted into the store within `tx`, so the job
    /// exists if and only if the caller's other writes do. Nothing runs until
    /// `tx` commits; if it rolls back the returned handle resolves to
    /// [`JobError::Abandoned`](crate::JobError::Abandoned).
    ///
    /// # Errors
    /// If the queue has shut down, the item cannot be encoded, or the store
    /// rejects the insert
    pub async fn add(
        &self,
        work: Work<W::Item>,
        tx: &mut Transaction,
    ) -> Result<CompletionHandle<W::Output>, QueueError> {
        if matches!(*self.inner.phase.lock(), Phase::ShutDown) {
            return Err(QueueError::AlreadyShutDown);
        }

        let (priority, position, kind) = match work {
            Work::Persisted { item, priority } => {
                let mut record = JobRecord::encode(&item, priority)?;
                self.inner.store.insert(&mut record, tx).await?;
                let position = self.inner.positions.persisted(record.insertion_order);
                (priority, position, JobKind::Persisted(record.id))
            }
            Work::Transient { item, priority } => {
                tx.ensure_usable(self.inner.store.store_id())?;
                let job = TransientJob {
                    id: TransientId::next(),
                    item,
                    failure_count: 0,
                };
                (priority, self.inner.positions.transient(), JobKind::Transient(job))
            }
        };

        let key = kind.key();
        tracing::debug!(job_id = %key, lane = %priority, "Job added");
        let handle = self.inner.completions.register(key);

        let inner = Arc::clone(&self.inner);
        tx.on_commit(move || inner.admit(priority, position, kind));
        let inner = Arc::clone(&self.inner);
        tx.on_rollback(move || {
            tracing::debug!(job_id = %key, "Enqueueing transaction rolled back");
            inner.completions.abandon(&key);
        });

        Ok(handle)
    }

    /// Recover persisted work and start the lanes.
    ///
    /// Records left `Executing` by a previous process are reset to `Ready`
    /// without counting a failure. Ready records are queued in insertion
    /// order, except those whose retry is still in the future, which get
    /// their timer re-armed for the time remaining. Calling this again once
    /// the queue is running does nothing.
    ///
    /// # Errors
    /// If the store cannot be read, or the queue has shut down
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn set_up(&self) -> Result<(), QueueError> {
        {
            let mut phase = self.inner.phase.lock();
            match &mut *phase {
                Phase::Idle(deferred) => {
                    let deferred = std::mem::take(deferred);
                    *phase = Phase::Loading(deferred);
                }
                Phase::Loading(_) | Phase::Running => return Ok(()),
                Phase::ShutDown => return Err(QueueError::AlreadyShutDown),
            }
        }

        match self.inner.recover().await {
            Ok(recovered) => self.inner.start(recovered),
            Err(e) => {
                tracing::error!(error = %e, "Failed to recover job records");
                let mut phase = self.inner.phase.lock();
                if let Phase::Loading(deferred) = &mut *phase {
                    let deferred = std::mem::take(deferred);
                    *phase = Phase::Idle(deferred);
                }
                Err(e.into())
            }
        }
    }

    /// Run the earliest pending retry now instead of waiting for its timer.
    ///
    /// Returns the job that was retried, or `None` if no retry is pending.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub fn run_any_queued_retry(&self) -> Option<JobKey> {
        let key = self.inner.scheduler.run_earliest();
        if let Some(key) = &key {
            tracing::info!(job_id = %key, "Running queued retry ahead of its timer");
        }
        key
    }

    /// Jobs waiting on a retry timer, earliest first, with the time left
    pub fn pending_retries(&self) -> Vec<(JobKey, Duration)> {
        self.inner.scheduler.pending()
    }

    /// Stop the queue.
    ///
    /// Lanes finish their in-flight attempt and stop; armed retry timers are
    /// cancelled. Waits at most the configured shutdown timeout for the
    /// lanes. Handles that have not settled resolve to
    /// [`JobError::Abandoned`](crate::JobError::Abandoned); persisted jobs
    /// remain in the store for the next set up.
    ///
    /// # Errors
    /// If the queue was already shut down
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn shut_down(&self) -> Result<(), QueueError> {
        let previous = std::mem::replace(&mut *self.inner.phase.lock(), Phase::ShutDown);
        match previous {
            Phase::ShutDown => return Err(QueueError::AlreadyShutDown),
            Phase::Idle(deferred) | Phase::Loading(deferred) => {
                for (_, _, kind) in deferred {
                    self.inner.completions.abandon(&kind.key());
                }
            }
            Phase::Running => {}
        }

        internal!(level = INFO, "Job queue shutting down");
        let _ = self.inner.shutdown.send(Signal::Shutdown);

        let disarmed = self.inner.scheduler.cancel_all();
        for retry in &disarmed {
            self.inner.completions.abandon(&retry.key());
        }
        if !disarmed.is_empty() {
            internal!(level = DEBUG, "Cancelled {} armed retries", disarmed.len());
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let drained = tokio::time::timeout(self.inner.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Lane task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Shutdown timeout exceeded, in-flight jobs will be recovered on the next set up"
            );
            tasks.detach_all();
        }

        for lane in self.inner.lanes.iter() {
            lane.clear();
        }
        self.inner.completions.clear();

        internal!(level = INFO, "Job queue shut down");
        Ok(())
    }
}

impl<W: Worker> Inner<W> {
    /// Commit hook: hand newly committed work to its lane
    fn admit(&self, priority: Priority, position: Position, kind: JobKind<W::Item>) {
        let mut phase = self.phase.lock();
        match &mut *phase {
            Phase::Idle(deferred) | Phase::Loading(deferred) => {
                deferred.push((priority, position, kind));
            }
            Phase::Running => {
                let key = kind.key();
                if !self.lanes.get(priority).admit(position, kind) {
                    tracing::debug!(job_id = %key, "Job already queued");
                }
            }
            Phase::ShutDown => self.completions.abandon(&kind.key()),
        }
    }

    /// Reset in-flight records and read everything that is ready
    async fn recover(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut tx = self.store.begin();

        let in_flight = self.store.find_by_status(JobStatus::Executing, &tx).await?;
        for mut record in in_flight {
            tracing::warn!(
                job_id = %record.id,
                failure_count = record.failure_count,
                "Job was executing when the queue last stopped, resetting to ready"
            );
            record.transition(JobStatus::Ready)?;
            self.store.update(&record, &mut tx).await?;
        }

        let ready = self.store.find_by_status(JobStatus::Ready, &tx).await?;
        self.store.commit(&mut tx).await?;
        Ok(ready)
    }

    /// Queue recovered and deferred work, then spawn the lanes
    fn start(self: &Arc<Self>, recovered: Vec<JobRecord>) -> Result<(), QueueError> {
        let mut phase = self.phase.lock();
        let deferred = match std::mem::replace(&mut *phase, Phase::Running) {
            Phase::Loading(deferred) => deferred,
            Phase::ShutDown => {
                *phase = Phase::ShutDown;
                return Err(QueueError::AlreadyShutDown);
            }
            other => {
                *phase = other;
                return Ok(());
            }
        };

        // Work added during this process is queued behind older records
        let fresh: HashSet<_> = deferred.iter().map(|(_, _, kind)| kind.key()).collect();
        let now = now_ms();
        let mut recovered_through = 0u64;
        let mut queued = 0usize;
        let mut armed = 0usize;

        for record in recovered {
            let key = JobKey::Record(record.id);
            if fresh.contains(&key) {
                continue;
            }

            recovered_through = recovered_through.max(record.insertion_order);
            let lane = self.lanes.get(record.priority);
            let position = self.positions.persisted(record.insertion_order);
            let kind = JobKind::Persisted(record.id);
            match record.retry_due_in(now) {
                Some(delay) => {
                    let Some(job) = lane.track(position, kind) else {
                        continue;
                    };
                    let retry = Retry {
                        lane: Arc::clone(lane),
                        job,
                    };
                    if self.scheduler.schedule(delay, retry).is_ok() {
                        armed += 1;
                    } else {
                        lane.release(&key);
                    }
                }
                None => {
                    if lane.admit(position, kind) {
                        queued += 1;
                    }
                }
            }
        }

        // Transient work added before any record of this process was
        // inserted still belongs behind what was recovered
        self.positions.observe(recovered_through);
        for (priority, position, kind) in deferred {
            self.lanes
                .get(priority)
                .admit(position.behind(recovered_through), kind);
        }

        let mut tasks = self.tasks.lock();
        for lane in self.lanes.iter() {
            tasks.spawn(dispatch::run_lane(
                Arc::clone(self),
                Arc::clone(lane),
                self.shutdown.subscribe(),
            ));
        }
        drop(tasks);
        drop(phase);

        internal!(
            level = INFO,
            "Job queue started: {} recovered jobs queued, {} retries re-armed",
            queued,
            armed
        );
        Ok(())
    }
}
