//! The per-lane dispatch loop and the execution of a single job

use std::{sync::Arc, time::Duration};

use courier_common::{JobStatus, Signal, internal};
use courier_store::{JobRecord, JobRecordId, StoreError};
use tokio::sync::broadcast::{self, error::TryRecvError};

use super::{
    Inner, JobKey,
    lane::{JobKind, Lane, Position, QueuedJob, Retry, TransientJob},
};
use crate::{
    classifier::Verdict,
    error::{JobError, WorkerError},
    worker::Worker,
};

/// Run the jobs of `lane` one at a time until shutdown is signalled.
///
/// Shutdown is checked between jobs only; an attempt in progress always runs
/// to completion.
pub(super) async fn run_lane<W: Worker>(
    inner: Arc<Inner<W>>,
    lane: Arc<Lane<W::Item>>,
    mut shutdown: broadcast::Receiver<Signal>,
) {
    internal!("Lane {} dispatching", lane.priority());

    loop {
        match shutdown.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(_) | Err(TryRecvError::Closed | TryRecvError::Lagged(_)) => break,
        }

        if let Some(job) = lane.pop() {
            inner.execute(&lane, job).await;
            continue;
        }

        tokio::select! {
            () = lane.ready() => {}
            _ = shutdown.recv() => break,
        }
    }

    internal!("Lane {} stopped", lane.priority());
}

impl<W: Worker> Inner<W> {
    async fn execute(&self, lane: &Arc<Lane<W::Item>>, job: QueuedJob<W::Item>) {
        let QueuedJob { position, kind } = job;
        match kind {
            JobKind::Persisted(id) => self.execute_persisted(lane, position, id).await,
            JobKind::Transient(job) => self.execute_transient(lane, position, job).await,
        }
    }

    async fn execute_persisted(
        &self,
        lane: &Arc<Lane<W::Item>>,
        position: Position,
        id: JobRecordId,
    ) {
        let key = JobKey::Record(id);

        let mut record = match self.claim(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(job_id = %id, "Job record is no longer ready, skipping");
                lane.release(&key);
                self.completions.abandon(&key);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Failed to claim job record");
                self.settle(lane, key, Err(e.into()));
                return;
            }
        };

        let item = match record.decode::<W::Item>() {
            Ok(item) => item,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(job_id = %id, error = %reason, "Job record payload is malformed");
                record.last_error = Some(reason.clone());
                let outcome = match self.save(&mut record, JobStatus::PermanentlyFailed).await {
                    Ok(()) => JobError::Malformed(reason),
                    Err(e) => store_failure(&id, e),
                };
                self.settle(lane, key, Err(outcome));
                return;
            }
        };

        match self.worker.perform(&item).await {
            Ok(output) => {
                match self.remove(&id).await {
                    Ok(()) => tracing::debug!(job_id = %id, lane = %lane.priority(), "Job completed"),
                    Err(e) => tracing::error!(
                        job_id = %id,
                        error = %e,
                        "Job completed but its record could not be removed, it will run again on the next set up"
                    ),
                }
                self.settle(lane, key, Ok(output));
            }
            Err(error) => {
                record.failure_count = record.failure_count.saturating_add(1);
                record.last_error = Some(error.to_string());

                match self.judge(key, error, record.failure_count) {
                    Ok(delay) => {
                        record.set_next_attempt_in(Some(delay));
                        match self.save(&mut record, JobStatus::Ready).await {
                            Ok(()) => self.arm(
                                lane,
                                delay,
                                QueuedJob {
                                    position,
                                    kind: JobKind::Persisted(id),
                                },
                            ),
                            Err(e) => {
                                let outcome = store_failure(&id, e);
                                self.settle(lane, key, Err(outcome));
                            }
                        }
                    }
                    Err(job_error) => {
                        let outcome = match self.save(&mut record, JobStatus::PermanentlyFailed).await {
                            Ok(()) => job_error,
                            Err(e) => store_failure(&id, e),
                        };
                        self.settle(lane, key, Err(outcome));
                    }
                }
            }
        }
    }

    async fn execute_transient(
        &self,
        lane: &Arc<Lane<W::Item>>,
        position: Position,
        mut job: TransientJob<W::Item>,
    ) {
        let key = JobKey::Transient(job.id);

        match self.worker.perform(&job.item).await {
            Ok(output) => {
                tracing::debug!(job_id = %key, lane = %lane.priority(), "Job completed");
                self.settle(lane, key, Ok(output));
            }
            Err(error) => {
                job.failure_count = job.failure_count.saturating_add(1);
                match self.judge(key, error, job.failure_count) {
                    Ok(delay) => self.arm(
                        lane,
                        delay,
                        QueuedJob {
                            position,
                            kind: JobKind::Transient(job),
                        },
                    ),
                    Err(job_error) => self.settle(lane, key, Err(job_error)),
                }
            }
        }
    }

    /// Decide what a failure means for a job that has now failed
    /// `failure_count` times: the delay before its next attempt, or the
    /// error its handle rejects with.
    fn judge(&self, key: JobKey, error: WorkerError, failure_count: u32) -> Result<Duration, JobError> {
        match self.classifier.classify(&error) {
            Verdict::Permanent => {
                tracing::warn!(job_id = %key, failure_count, error = %error, "Job failed permanently");
                Err(JobError::Permanent(error))
            }
            Verdict::Retryable if !self.policy.should_retry(failure_count) => {
                tracing::warn!(
                    job_id = %key,
                    failure_count,
                    max_retries = self.policy.max_retries,
                    error = %error,
                    "Job exhausted its retries"
                );
                Err(JobError::RetriesExhausted {
                    failure_count,
                    last_error: error,
                })
            }
            Verdict::Retryable => {
                let delay = self.policy.next_delay(failure_count);
                tracing::info!(
                    job_id = %key,
                    failure_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Job failed, scheduling retry"
                );
                Ok(delay)
            }
        }
    }

    /// Park a job in the retry scheduler until its backoff elapses
    fn arm(&self, lane: &Arc<Lane<W::Item>>, delay: Duration, job: QueuedJob<W::Item>) {
        let key = job.key();
        let retry = Retry {
            lane: Arc::clone(lane),
            job,
        };
        if self.scheduler.schedule(delay, retry).is_err() {
            tracing::debug!(job_id = %key, "Queue is shutting down, retry not armed");
            lane.release(&key);
            self.completions.abandon(&key);
        }
    }

    fn settle(&self, lane: &Lane<W::Item>, key: JobKey, outcome: Result<W::Output, JobError>) {
        lane.release(&key);
        self.completions.settle(&key, outcome);
    }

    /// Move a ready record to `Executing`.
    ///
    /// Returns `None` if the record is gone or no longer ready.
    async fn claim(&self, id: &JobRecordId) -> Result<Option<JobRecord>, StoreError> {
        let mut tx = self.store.begin();
        let Some(mut record) = self.store.fetch(id, &tx).await? else {
            return Ok(None);
        };
        if record.status != JobStatus::Ready {
            return Ok(None);
        }

        record.transition(JobStatus::Executing)?;
        record.next_attempt_at_ms = None;
        self.store.update(&record, &mut tx).await?;
        self.store.commit(&mut tx).await?;
        Ok(Some(record))
    }

    /// Move `record` to `status` and commit it, failure count and all
    async fn save(&self, record: &mut JobRecord, status: JobStatus) -> Result<(), StoreError> {
        record.transition(status)?;
        if status.is_terminal() {
            record.next_attempt_at_ms = None;
        }

        let mut tx = self.store.begin();
        self.store.update(record, &mut tx).await?;
        self.store.commit(&mut tx).await
    }

    async fn remove(&self, id: &JobRecordId) -> Result<(), StoreError> {
        let mut tx = self.store.begin();
        self.store.delete(id, &mut tx).await?;
        self.store.commit(&mut tx).await
    }
}

fn store_failure(id: &JobRecordId, error: StoreError) -> JobError {
    tracing::error!(
        job_id = %id,
        error = %error,
        "Failed to record job outcome, the record keeps its last committed state"
    );
    JobError::Store(error)
}
