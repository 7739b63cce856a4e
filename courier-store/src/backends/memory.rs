use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use courier_common::JobStatus;
use serde::{Deserialize, Serialize};

use crate::{
    JobRecord, JobRecordId, Result, StoreError, StoreId, Transaction, Write,
    r#trait::JobRecordStore,
};

/// The committed contents of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    pub(crate) records: HashMap<JobRecordId, JobRecord>,
}

impl Tables {
    /// Apply `writes` all-or-nothing.
    ///
    /// Every write is checked against committed state (and earlier writes of
    /// the same batch) before anything is mutated.
    pub(crate) fn apply(&mut self, writes: Vec<Write>, capacity: Option<usize>) -> Result<()> {
        let mut changes: HashMap<JobRecordId, Option<JobRecord>> = HashMap::new();

        for write in writes {
            let current = changes.get(write.record_id()).map_or_else(
                || self.records.get(write.record_id()),
                Option::as_ref,
            );

            match write {
                Write::Insert(record) => {
                    if current.is_some() {
                        return Err(StoreError::AlreadyExists(record.id));
                    }
                    changes.insert(record.id, Some(record));
                }
                Write::Update(record) => {
                    let Some(current) = current else {
                        return Err(StoreError::NotFound(record.id));
                    };
                    if current.status != record.status
                        && !current.status.can_transition_to(record.status)
                    {
                        return Err(StoreError::InvalidTransition {
                            id: record.id,
                            from: current.status,
                            to: record.status,
                        });
                    }
                    changes.insert(record.id, Some(record));
                }
                Write::Delete(id) => {
                    changes.insert(id, None);
                }
            }
        }

        if let Some(capacity) = capacity {
            let used = changes.iter().fold(self.records.len(), |used, (id, change)| {
                match (self.records.contains_key(id), change.is_some()) {
                    (false, true) => used + 1,
                    (true, false) => used - 1,
                    _ => used,
                }
            });
            if used > capacity {
                return Err(StoreError::CapacityExceeded { used, capacity });
            }
        }

        for (id, change) in changes {
            match change {
                Some(record) => {
                    self.records.insert(id, record);
                }
                None => {
                    self.records.remove(&id);
                }
            }
        }

        Ok(())
    }

    /// Records with `status` as seen through `tx`, in insertion order
    fn find_by_status(&self, status: JobStatus, tx: &Transaction) -> Vec<JobRecord> {
        let mut found: Vec<JobRecord> = self
            .records
            .values()
            .filter(|record| record.status == status && tx.staged_record(&record.id).is_none())
            .cloned()
            .collect();

        let mut seen = HashSet::new();
        for write in tx.staged().iter().rev() {
            if !seen.insert(*write.record_id()) {
                continue;
            }
            if let Write::Insert(record) | Write::Update(record) = write
                && record.status == status
            {
                found.push(record.clone());
            }
        }

        found.sort_by_key(|record| record.insertion_order);
        found
    }
}

/// In-memory job record store
///
/// Records live in a `HashMap` behind an `RwLock`. Cloning the store yields
/// another handle onto the same tables, which is how tests simulate a process
/// restart: drop the queue, keep the store, build a new queue over it.
///
/// # Capacity Management
/// An optional capacity bounds the number of committed records. A commit
/// that would exceed it fails and is rolled back.
#[derive(Debug, Clone)]
pub struct MemoryJobRecordStore {
    id: StoreId,
    pub(crate) tables: Arc<RwLock<Tables>>,
    next_insertion_order: Arc<AtomicU64>,
    capacity: Option<usize>,
}

impl MemoryJobRecordStore {
    /// Create a new empty store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: StoreId::next(),
            tables: Arc::new(RwLock::new(Tables::default())),
            next_insertion_order: Arc::new(AtomicU64::new(1)),
            capacity: None,
        }
    }

    /// Create a new store holding at most `capacity` records
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Rebuild a store from previously committed records
    pub(crate) fn restore(tables: Tables, next_insertion_order: u64, capacity: Option<usize>) -> Self {
        let next = tables
            .records
            .values()
            .map(|record| record.insertion_order + 1)
            .max()
            .unwrap_or(1)
            .max(next_insertion_order);

        Self {
            id: StoreId::next(),
            tables: Arc::new(RwLock::new(tables)),
            next_insertion_order: Arc::new(AtomicU64::new(next)),
            capacity,
        }
    }

    /// Number of committed records
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .records
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[must_use]
    pub const fn store_id(&self) -> StoreId {
        self.id
    }

    /// All committed records in insertion order
    #[must_use]
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self
            .tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .records
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|record| record.insertion_order);
        records
    }

    pub(crate) fn peek_next_insertion_order(&self) -> u64 {
        self.next_insertion_order.load(Ordering::SeqCst)
    }

    /// Apply the staged writes of `tx` to a copy of the committed tables
    ///
    /// The live tables are untouched; the caller installs the result.
    pub(crate) fn prepare(&self, tx: &mut Transaction) -> Result<Tables> {
        tx.ensure_usable(self.id)?;
        let writes = tx.take_writes();
        let mut tables = self.tables.read()?.clone();
        match tables.apply(writes, self.capacity) {
            Ok(()) => Ok(tables),
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    pub(crate) fn install(&self, tables: Tables) -> Result<()> {
        *self.tables.write()? = tables;
        Ok(())
    }
}

impl Default for MemoryJobRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRecordStore for MemoryJobRecordStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    fn begin(&self) -> Transaction {
        Transaction::begin(self.id)
    }

    async fn insert(&self, record: &mut JobRecord, tx: &mut Transaction) -> Result<()> {
        tx.ensure_usable(self.id)?;

        let exists = match tx.staged_record(&record.id) {
            Some(staged) => staged.is_some(),
            None => self.tables.read()?.records.contains_key(&record.id),
        };
        if exists {
            return Err(StoreError::AlreadyExists(record.id));
        }

        if let Some(capacity) = self.capacity {
            let used = self.len();
            if used >= capacity {
                return Err(StoreError::CapacityExceeded { used, capacity });
            }
        }

        record.insertion_order = self.next_insertion_order.fetch_add(1, Ordering::SeqCst);
        tx.stage(Write::Insert(record.clone()));
        Ok(())
    }

    async fn fetch(&self, id: &JobRecordId, tx: &Transaction) -> Result<Option<JobRecord>> {
        tx.ensure_usable(self.id)?;

        if let Some(staged) = tx.staged_record(id) {
            return Ok(staged.cloned());
        }
        Ok(self.tables.read()?.records.get(id).cloned())
    }

    async fn find_by_status(&self, status: JobStatus, tx: &Transaction) -> Result<Vec<JobRecord>> {
        tx.ensure_usable(self.id)?;
        Ok(self.tables.read()?.find_by_status(status, tx))
    }

    async fn update(&self, record: &JobRecord, tx: &mut Transaction) -> Result<()> {
        tx.ensure_usable(self.id)?;

        let exists = match tx.staged_record(&record.id) {
            Some(staged) => staged.is_some(),
            None => self.tables.read()?.records.contains_key(&record.id),
        };
        if !exists {
            return Err(StoreError::NotFound(record.id));
        }

        tx.stage(Write::Update(record.clone()));
        Ok(())
    }

    async fn delete(&self, id: &JobRecordId, tx: &mut Transaction) -> Result<()> {
        tx.ensure_usable(self.id)?;
        tx.stage(Write::Delete(*id));
        Ok(())
    }

    async fn commit(&self, tx: &mut Transaction) -> Result<()> {
        tx.ensure_usable(self.id)?;
        let writes = tx.take_writes();

        let applied = self.tables.write()?.apply(writes, self.capacity);
        match applied {
            Ok(()) => {
                tx.finish_commit();
                Ok(())
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use courier_common::Priority;

    use super::*;

    fn record(tag: u8) -> JobRecord {
        JobRecord::encode(&tag, Priority::Normal).expect("encode")
    }

    async fn insert_committed(store: &MemoryJobRecordStore, tag: u8) -> JobRecord {
        let mut tx = store.begin();
        let mut record = record(tag);
        store.insert(&mut record, &mut tx).await.expect("insert");
        store.commit(&mut tx).await.expect("commit");
        record
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryJobRecordStore::new();
        let mut record = insert_committed(&store, 1).await;
        assert_eq!(store.len(), 1);

        let mut tx = store.begin();
        let fetched = store.fetch(&record.id, &tx).await.expect("fetch");
        assert_eq!(fetched.as_ref(), Some(&record));

        record.transition(JobStatus::Executing).unwrap();
        store.update(&record, &mut tx).await.expect("update");
        store.commit(&mut tx).await.expect("commit");

        let tx = store.begin();
        assert!(
            store
                .find_by_status(JobStatus::Ready, &tx)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            store.find_by_status(JobStatus::Executing, &tx).await.unwrap(),
            vec![record.clone()]
        );
        drop(tx);

        let mut tx = store.begin();
        store.delete(&record.id, &mut tx).await.expect("delete");
        store.delete(&record.id, &mut tx).await.expect("delete twice");
        store.commit(&mut tx).await.expect("commit");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryJobRecordStore::new();
        let mut tx = store.begin();
        let mut pending = record(1);
        store.insert(&mut pending, &mut tx).await.unwrap();

        let other = store.begin();
        assert_eq!(store.fetch(&pending.id, &other).await.unwrap(), None);
        assert_eq!(
            store.fetch(&pending.id, &tx).await.unwrap(),
            Some(pending.clone()),
            "a transaction reads its own writes"
        );

        tx.rollback();
        drop(other);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = MemoryJobRecordStore::new();
        let mut tx = store.begin();
        let mut ids = Vec::new();
        for tag in 0..10 {
            let mut record = record(tag);
            store.insert(&mut record, &mut tx).await.unwrap();
            ids.push(record.id);
        }
        store.commit(&mut tx).await.unwrap();

        let tx = store.begin();
        let ready = store.find_by_status(JobStatus::Ready, &tx).await.unwrap();
        assert_eq!(ready.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        assert!(
            ready
                .windows(2)
                .all(|pair| pair[0].insertion_order < pair[1].insertion_order)
        );
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let store = MemoryJobRecordStore::new();
        let existing = insert_committed(&store, 1).await;

        let mut tx = store.begin();
        let mut fresh = record(2);
        store.insert(&mut fresh, &mut tx).await.unwrap();
        // Illegal edge: Ready -> PermanentlyFailed
        let mut bad = existing.clone();
        bad.status = JobStatus::PermanentlyFailed;
        store.update(&bad, &mut tx).await.unwrap();

        let err = store.commit(&mut tx).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.records(), vec![existing]);

        assert!(matches!(
            store.commit(&mut tx).await,
            Err(StoreError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_and_foreign_transactions() {
        let store = MemoryJobRecordStore::new();
        let other = MemoryJobRecordStore::new();

        let mut foreign = other.begin();
        let mut rec = record(1);
        assert!(matches!(
            store.insert(&mut rec, &mut foreign).await,
            Err(StoreError::ForeignTransaction(_))
        ));

        let mut tx = store.begin();
        store.commit(&mut tx).await.unwrap();
        assert!(matches!(
            store.insert(&mut rec, &mut tx).await,
            Err(StoreError::TransactionClosed(_))
        ));
        assert!(matches!(
            store.find_by_status(JobStatus::Ready, &tx).await,
            Err(StoreError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryJobRecordStore::new();
        let mut tx = store.begin();
        let rec = record(1);
        assert!(matches!(
            store.update(&rec, &mut tx).await,
            Err(StoreError::NotFound(id)) if id == rec.id
        ));
    }

    #[tokio::test]
    async fn test_memory_store_capacity_limit() {
        let store = MemoryJobRecordStore::with_capacity(2);
        let first = insert_committed(&store, 1).await;
        insert_committed(&store, 2).await;

        let mut tx = store.begin();
        let mut third = record(3);
        let result = store.insert(&mut third, &mut tx).await;
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded {
                used: 2,
                capacity: 2
            })
        ));

        store.delete(&first.id, &mut tx).await.unwrap();
        store.commit(&mut tx).await.unwrap();

        insert_committed(&store, 3).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.capacity(), Some(2));
    }

    #[tokio::test]
    async fn test_clones_share_tables() {
        let store = MemoryJobRecordStore::new();
        let handle = store.clone();
        let rec = insert_committed(&store, 9).await;

        let tx = handle.begin();
        assert_eq!(handle.fetch(&rec.id, &tx).await.unwrap(), Some(rec));
    }
}
