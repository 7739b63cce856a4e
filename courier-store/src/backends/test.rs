use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_common::JobStatus;
use tokio::sync::Notify;

use super::memory::MemoryJobRecordStore;
use crate::{
    JobRecord, JobRecordId, Result, StoreError, StoreId, Transaction, r#trait::JobRecordStore,
};

/// Testing wrapper around the memory store
///
/// Adds waiting for commits, synchronous inspection, and injected commit
/// failures for exercising store-error paths.
#[derive(Debug, Clone, Default)]
pub struct TestJobRecordStore {
    inner: MemoryJobRecordStore,
    notify: Arc<Notify>,
    commits: Arc<AtomicUsize>,
    failing_commits: Arc<AtomicUsize>,
}

impl TestJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Internal`]
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Wait until at least `expected` commits have succeeded
    ///
    /// # Errors
    /// Returns an error if the timeout is reached first
    pub async fn wait_for_commits(&self, expected: usize, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.commit_count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|e| StoreError::Internal(format!("Timeout waiting for commits: {e}")))
    }

    /// All committed records in insertion order
    pub fn records(&self) -> Vec<JobRecord> {
        self.inner.records()
    }

    /// The committed state of one record
    pub fn record(&self, id: &JobRecordId) -> Option<JobRecord> {
        self.records().into_iter().find(|record| record.id == *id)
    }

    /// Committed records with `status`, in insertion order
    pub fn records_with_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.status == status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl JobRecordStore for TestJobRecordStore {
    fn store_id(&self) -> StoreId {
        self.inner.store_id()
    }

    fn begin(&self) -> Transaction {
        self.inner.begin()
    }

    async fn insert(&self, record: &mut JobRecord, tx: &mut Transaction) -> Result<()> {
        self.inner.insert(record, tx).await
    }

    async fn fetch(&self, id: &JobRecordId, tx: &Transaction) -> Result<Option<JobRecord>> {
        self.inner.fetch(id, tx).await
    }

    async fn find_by_status(&self, status: JobStatus, tx: &Transaction) -> Result<Vec<JobRecord>> {
        self.inner.find_by_status(status, tx).await
    }

    async fn update(&self, record: &JobRecord, tx: &mut Transaction) -> Result<()> {
        self.inner.update(record, tx).await
    }

    async fn delete(&self, id: &JobRecordId, tx: &mut Transaction) -> Result<()> {
        self.inner.delete(id, tx).await
    }

    async fn commit(&self, tx: &mut Transaction) -> Result<()> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tx.ensure_usable(self.inner.store_id())?;
            tx.rollback();
            return Err(StoreError::Internal("injected commit failure".to_string()));
        }

        self.inner.commit(tx).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use courier_common::Priority;

    use super::*;

    #[tokio::test]
    async fn test_injected_failures_roll_back() {
        let store = TestJobRecordStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin();
        let mut record = JobRecord::encode(&1u8, Priority::Normal).unwrap();
        store.insert(&mut record, &mut tx).await.unwrap();
        assert!(matches!(
            store.commit(&mut tx).await,
            Err(StoreError::Internal(_))
        ));
        assert!(store.is_empty());
        assert_eq!(store.commit_count(), 0);

        let mut tx = store.begin();
        store.insert(&mut record, &mut tx).await.unwrap();
        store.commit(&mut tx).await.unwrap();
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.record(&record.id), Some(record));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_for_commits() {
        let store = TestJobRecordStore::new();
        let writer = store.clone();

        let handle = tokio::spawn(async move {
            for tag in 0..3u8 {
                let mut tx = writer.begin();
                let mut record = JobRecord::encode(&tag, Priority::Normal).unwrap();
                writer.insert(&mut record, &mut tx).await.unwrap();
                writer.commit(&mut tx).await.unwrap();
            }
        });

        store
            .wait_for_commits(3, Duration::from_secs(5))
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(store.records_with_status(JobStatus::Ready).len(), 3);
    }
}
