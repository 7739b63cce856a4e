//! Armed retry timers.
//!
//! Every pending retry owns one slot in the scheduler. Whoever removes the
//! slot (its own timer firing, a forced retry, or cancellation) is the only
//! one that gets to act on it, so a forced retry racing the timer for the
//! same job cannot run the job twice.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};

use super::JobKey;

/// Longest delay a timer is armed for; anything later is clamped
const MAX_ARMED: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// A job waiting out its backoff
pub(crate) trait Resume: Send + 'static {
    fn key(&self) -> JobKey;

    /// Hand the job back for execution
    fn resume(self);
}

struct Slot<J> {
    due: Instant,
    seq: u64,
    job: J,
    timer: JoinHandle<()>,
}

struct State<J> {
    slots: HashMap<JobKey, Slot<J>>,
    next_seq: u64,
    cancelled: bool,
}

pub(crate) struct RetryScheduler<J> {
    state: Arc<Mutex<State<J>>>,
}

impl<J> Default for RetryScheduler<J> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                next_seq: 0,
                cancelled: false,
            })),
        }
    }
}

impl<J: Resume> RetryScheduler<J> {
    /// Arm a timer that resumes `job` after `delay`.
    ///
    /// Hands the job back if the scheduler has been cancelled.
    pub(crate) fn schedule(&self, delay: Duration, job: J) -> Result<(), J> {
        let key = job.key();
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(job);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let due = Instant::now() + delay.min(MAX_ARMED);

        let slots = Arc::clone(&self.state);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            let fired = {
                let mut state = slots.lock();
                match state.slots.get(&key) {
                    Some(slot) if slot.seq == seq => state.slots.remove(&key),
                    _ => None,
                }
            };
            if let Some(slot) = fired {
                tracing::debug!(job_id = %key, "Retry timer fired");
                slot.job.resume();
            }
        });

        if let Some(replaced) = state.slots.insert(
            key,
            Slot {
                due,
                seq,
                job,
                timer,
            },
        ) {
            tracing::warn!(job_id = %key, "Replacing an already armed retry");
            replaced.timer.abort();
        }

        Ok(())
    }

    /// Cancel the timer of the earliest due retry and resume it now.
    ///
    /// Returns `None`, doing nothing, if no retry is armed.
    pub(crate) fn run_earliest(&self) -> Option<JobKey> {
        let slot = {
            let mut state = self.state.lock();
            let key = state
                .slots
                .iter()
                .min_by_key(|(_, slot)| (slot.due, slot.seq))
                .map(|(key, _)| *key)?;
            state.slots.remove(&key)?
        };

        slot.timer.abort();
        let key = slot.job.key();
        slot.job.resume();
        Some(key)
    }

    /// Disarm every timer and refuse further scheduling.
    ///
    /// Returns the jobs that were waiting, earliest first.
    pub(crate) fn cancel_all(&self) -> Vec<J> {
        let mut slots: Vec<Slot<J>> = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.slots.drain().map(|(_, slot)| slot).collect()
        };

        slots.sort_by_key(|slot| (slot.due, slot.seq));
        slots
            .into_iter()
            .map(|slot| {
                slot.timer.abort();
                slot.job
            })
            .collect()
    }

    /// Keys of the armed retries, earliest first, with the time left on each
    pub(crate) fn pending(&self) -> Vec<(JobKey, Duration)> {
        let now = Instant::now();
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .slots
            .iter()
            .map(|(key, slot)| (slot.due, slot.seq, *key))
            .collect();
        drop(state);

        pending.sort_unstable();
        pending
            .into_iter()
            .map(|(due, _, key)| (key, due.saturating_duration_since(now)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().slots.len()
    }
}
