use async_trait::async_trait;
use courier_common::JobStatus;

use crate::{JobRecord, JobRecordId, Result, StoreId, Transaction};

/// Transactional storage of job records.
///
/// Every write is staged in a caller-supplied [`Transaction`] and becomes
/// visible to other transactions only when [`JobRecordStore::commit`] applies
/// the whole transaction atomically. Reads through a transaction observe its
/// own staged writes.
///
/// Stores expose no locking beyond that atomicity; the queue is responsible
/// for running at most one attempt per record.
#[async_trait]
pub trait JobRecordStore: Send + Sync + std::fmt::Debug {
    /// Identity of this store; only its own transactions are accepted
    fn store_id(&self) -> StoreId;

    /// Open a new transaction on this store
    fn begin(&self) -> Transaction;

    /// Stage the insertion of `record`, assigning its `insertion_order`
    ///
    /// # Errors
    /// If the transaction is closed or foreign, the id already exists, or
    /// the store is full
    async fn insert(&self, record: &mut JobRecord, tx: &mut Transaction) -> Result<()>;

    /// Look up a record by id
    ///
    /// # Errors
    /// If the transaction is closed or foreign
    async fn fetch(&self, id: &JobRecordId, tx: &Transaction) -> Result<Option<JobRecord>>;

    /// All records with `status`, in insertion (FIFO) order
    ///
    /// # Errors
    /// If the transaction is closed or foreign
    async fn find_by_status(&self, status: JobStatus, tx: &Transaction) -> Result<Vec<JobRecord>>;

    /// Stage a full replacement of an existing record
    ///
    /// # Errors
    /// If the transaction is closed or foreign, or the record does not exist
    async fn update(&self, record: &JobRecord, tx: &mut Transaction) -> Result<()>;

    /// Stage the removal of a record. Removing an absent record is a no-op.
    ///
    /// # Errors
    /// If the transaction is closed or foreign
    async fn delete(&self, id: &JobRecordId, tx: &mut Transaction) -> Result<()>;

    /// Apply every staged write atomically, then run the commit hooks.
    ///
    /// On failure nothing is applied and the transaction is rolled back.
    ///
    /// # Errors
    /// If the transaction is closed or foreign, a staged write conflicts with
    /// committed state, or the store cannot persist the result
    async fn commit(&self, tx: &mut Transaction) -> Result<()>;
}
