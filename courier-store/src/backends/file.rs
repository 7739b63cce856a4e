use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use courier_common::JobStatus;
use courier_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::memory::{MemoryJobRecordStore, Tables};
use crate::{
    JobRecord, JobRecordId, Result, SerializationError, StoreId, Transaction,
    r#trait::JobRecordStore,
};

const SNAPSHOT_FILE: &str = "jobs.bin";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    next_insertion_order: u64,
    tables: &'a Tables,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    next_insertion_order: u64,
    tables: Tables,
}

/// File-backed job record store
///
/// The committed tables are kept in memory and written in full to
/// `<path>/jobs.bin` on every commit. The snapshot is written to a temporary
/// file, synced, then renamed over the previous one, so a crash leaves either
/// the old or the new state on disk and never a torn file.
///
/// Commits are serialized; reads never touch the disk.
#[derive(Debug, Clone)]
pub struct FileJobRecordStore {
    path: PathBuf,
    inner: MemoryJobRecordStore,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileJobRecordStore {
    /// Open (or create) the store rooted at the directory `path`
    ///
    /// # Errors
    /// If the directory cannot be created or an existing snapshot cannot be read
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_capacity(path, None).await
    }

    /// Open (or create) the store rooted at `path`, holding at most `capacity` records
    ///
    /// # Errors
    /// If the directory cannot be created or an existing snapshot cannot be read
    pub async fn open_with_capacity(
        path: impl Into<PathBuf>,
        capacity: Option<usize>,
    ) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path).await?;

        let snapshot_path = path.join(SNAPSHOT_FILE);
        let inner = match tokio::fs::read(&snapshot_path).await {
            Ok(bytes) => {
                let (snapshot, _): (Snapshot, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(SerializationError::from)?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(SerializationError::Corrupted(format!(
                        "unsupported snapshot version {} in {}",
                        snapshot.version,
                        snapshot_path.display()
                    ))
                    .into());
                }

                tracing::debug!(
                    path = %snapshot_path.display(),
                    records = snapshot.tables.records.len(),
                    "Loaded job record snapshot"
                );
                MemoryJobRecordStore::restore(
                    snapshot.tables,
                    snapshot.next_insertion_order,
                    capacity,
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                MemoryJobRecordStore::restore(Tables::default(), 1, capacity)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            inner,
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// The directory holding the snapshot
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All committed records in insertion order
    #[must_use]
    pub fn records(&self) -> Vec<JobRecord> {
        self.inner.records()
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "us"))]
    async fn persist(&self, tables: &Tables) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(
            SnapshotRef {
                version: SNAPSHOT_VERSION,
                next_insertion_order: self.inner.peek_next_insertion_order(),
                tables,
            },
            bincode::config::standard(),
        )
        .map_err(SerializationError::from)?;

        let target = self.path.join(SNAPSHOT_FILE);
        let staging = self.path.join(format!("{SNAPSHOT_FILE}.tmp"));

        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRecordStore for FileJobRecordStore {
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
        let _guard = self.commit_lock.lock().await;

        let tables = self.inner.prepare(tx)?;
        if let Err(e) = self.persist(&tables).await {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "Failed to persist job record snapshot, rolling back"
            );
            tx.rollback();
            return Err(e);
        }

        self.inner.install(tables)?;
        tx.finish_commit();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use courier_common::Priority;

    use super::*;

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        let store = FileJobRecordStore::open(dir.path()).await.expect("open");
        let mut tx = store.begin();
        let mut first = JobRecord::encode(&"first", Priority::Normal).unwrap();
        let mut second = JobRecord::encode(&"second", Priority::High).unwrap();
        store.insert(&mut first, &mut tx).await.unwrap();
        store.insert(&mut second, &mut tx).await.unwrap();
        store.commit(&mut tx).await.unwrap();

        let mut tx = store.begin();
        first.transition(JobStatus::Executing).unwrap();
        first.failure_count = 1;
        store.update(&first, &mut tx).await.unwrap();
        store.commit(&mut tx).await.unwrap();
        drop(store);

        let reopened = FileJobRecordStore::open(dir.path()).await.expect("reopen");
        assert_eq!(reopened.records(), vec![first.clone(), second.clone()]);

        // Orders handed out after a reopen keep increasing
        let mut tx = reopened.begin();
        let mut third = JobRecord::encode(&"third", Priority::Normal).unwrap();
        reopened.insert(&mut third, &mut tx).await.unwrap();
        reopened.commit(&mut tx).await.unwrap();
        assert!(third.insertion_order > second.insertion_order);
    }

    #[tokio::test]
    async fn test_rolled_back_writes_are_not_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileJobRecordStore::open(dir.path()).await.expect("open");

        let mut tx = store.begin();
        let mut record = JobRecord::encode(&1u32, Priority::Normal).unwrap();
        store.insert(&mut record, &mut tx).await.unwrap();
        tx.rollback();

        let reopened = FileJobRecordStore::open(dir.path()).await.expect("reopen");
        assert!(reopened.records().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join(SNAPSHOT_FILE), b"definitely not bincode")
            .await
            .unwrap();

        assert!(FileJobRecordStore::open(dir.path()).await.is_err());
    }
}
