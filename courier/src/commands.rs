//! Inspection and maintenance of a job record store.
//!
//! These operate on the store directly rather than through a running queue,
//! so they should be run while the queue that owns the store is stopped.

use std::fmt::{self, Write as _};

use courier_common::{JobStatus, Priority};
use courier_store::{JobRecord, JobRecordStore, StoreError, types::now_ms};

/// Records in insertion order, optionally only those with `status`
///
/// # Errors
/// If the store cannot be read
pub async fn list(
    store: &dyn JobRecordStore,
    status: Option<JobStatus>,
) -> Result<Vec<JobRecord>, StoreError> {
    let tx = store.begin();
    let mut records = Vec::new();
    for status in status.map_or_else(|| JobStatus::ALL.to_vec(), |status| vec![status]) {
        records.extend(store.find_by_status(status, &tx).await?);
    }
    records.sort_by_key(|record| record.insertion_order);
    Ok(records)
}

/// Record counts by status and lane
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub ready: usize,
    pub executing: usize,
    pub failed: usize,
    pub high: usize,
    pub normal: usize,
    /// Ready records sitting out a retry backoff
    pub awaiting_retry: usize,
}

impl Stats {
    pub const fn total(&self) -> usize {
        self.ready + self.executing + self.failed
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Courier Job Statistics ===")?;
        writeln!(f)?;
        writeln!(f, "Total: {} job(s)", self.total())?;
        writeln!(f)?;
        writeln!(f, "Jobs by Status:")?;
        writeln!(f, "  {}: {}", JobStatus::Ready, self.ready)?;
        writeln!(f, "    awaiting retry: {}", self.awaiting_retry)?;
        writeln!(f, "  {}: {}", JobStatus::Executing, self.executing)?;
        writeln!(f, "  {}: {}", JobStatus::PermanentlyFailed, self.failed)?;
        writeln!(f)?;
        writeln!(f, "Jobs by Lane:")?;
        writeln!(f, "  {}: {}", Priority::High, self.high)?;
        write!(f, "  {}: {}", Priority::Normal, self.normal)
    }
}

/// Count the records in `store`
///
/// # Errors
/// If the store cannot be read
pub async fn stats(store: &dyn JobRecordStore) -> Result<Stats, StoreError> {
    let now = now_ms();

    Ok(list(store, None)
        .await?
        .iter()
        .fold(Stats::default(), |mut stats, record| {
            match record.status {
                JobStatus::Ready => {
                    stats.ready += 1;
                    if record.retry_due_in(now).is_some() {
                        stats.awaiting_retry += 1;
                    }
                }
                JobStatus::Executing => stats.executing += 1,
                JobStatus::PermanentlyFailed => stats.failed += 1,
            }
            match record.priority {
                Priority::High => stats.high += 1,
                Priority::Normal => stats.normal += 1,
            }
            stats
        }))
}

/// Delete every permanently failed record in one transaction.
///
/// Returns how many were deleted.
///
/// # Errors
/// If the store cannot be read or the deletion cannot be committed
pub async fn purge_failed(store: &dyn JobRecordStore) -> Result<usize, StoreError> {
    let mut tx = store.begin();
    let failed = store
        .find_by_status(JobStatus::PermanentlyFailed, &tx)
        .await?;

    for record in &failed {
        tracing::debug!(job_id = %record.id, "Purging failed job record");
        store.delete(&record.id, &mut tx).await?;
    }
    store.commit(&mut tx).await?;

    tracing::info!(purged = failed.len(), "Purged failed job records");
    Ok(failed.len())
}

/// Render records as a table, one per line
pub fn render_list(records: &[JobRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<28} {:<20} {:<8} {:>8}  {}",
        "JOB ID", "STATUS", "LANE", "FAILURES", "LAST ERROR"
    );
    let _ = writeln!(out, "{}", "-".repeat(90));

    for record in records {
        let _ = writeln!(
            out,
            "{:<28} {:<20} {:<8} {:>8}  {}",
            record.id.to_string(),
            record.status.as_str(),
            record.priority.to_string(),
            record.failure_count,
            record.last_error.as_deref().unwrap_or("-"),
        );
    }

    let _ = write!(out, "\nTotal: {} job(s)", records.len());
    out
}
