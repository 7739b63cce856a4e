//! Explicit transactions over a job record store
//!
//! A [`Transaction`] stages writes until its store commits them. Callers pass
//! it by `&mut` into every store operation, so the queue never relies on an
//! ambient or global transaction.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{JobRecord, JobRecordId, Result, StoreError};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a store instance, used to reject transactions begun elsewhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(u64);

impl StoreId {
    /// Allocate a process-unique store identity
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A write staged inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Insert(JobRecord),
    Update(JobRecord),
    Delete(JobRecordId),
}

impl Write {
    #[must_use]
    pub const fn record_id(&self) -> &JobRecordId {
        match self {
            Self::Insert(record) | Self::Update(record) => &record.id,
            Self::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

type Hook = Box<dyn FnOnce() + Send + Sync>;

pub struct Transaction {
    id: u64,
    owner: StoreId,
    state: TransactionState,
    writes: Vec<Write>,
    on_commit: Vec<Hook>,
    on_rollback: Vec<Hook>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("writes", &self.writes.len())
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .finish()
    }
}

impl Transaction {
    /// Open a new transaction against the store identified by `owner`
    #[must_use]
    pub fn begin(owner: StoreId) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            state: TransactionState::Open,
            writes: Vec::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Check that this transaction is open and was begun on `owner`
    ///
    /// # Errors
    /// [`StoreError::TransactionClosed`] or [`StoreError::ForeignTransaction`]
    pub fn ensure_usable(&self, owner: StoreId) -> Result<()> {
        if self.owner != owner {
            return Err(StoreError::ForeignTransaction(self.id));
        }
        if !self.is_open() {
            return Err(StoreError::TransactionClosed(self.id));
        }
        Ok(())
    }

    /// Stage a write. Store implementations validate before calling this.
    pub fn stage(&mut self, write: Write) {
        self.writes.push(write);
    }

    /// The writes staged so far, in order
    #[must_use]
    pub fn staged(&self) -> &[Write] {
        &self.writes
    }

    /// The latest staged view of `id`: `Some(Some(_))` for an insert/update,
    /// `Some(None)` for a delete, `None` if this transaction has not touched it
    #[must_use]
    pub fn staged_record(&self, id: &JobRecordId) -> Option<Option<&JobRecord>> {
        self.writes
            .iter()
            .rev()
            .find(|write| write.record_id() == id)
            .map(|write| match write {
                Write::Insert(record) | Write::Update(record) => Some(record),
                Write::Delete(_) => None,
            })
    }

    /// Run `hook` once this transaction commits
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Run `hook` if this transaction rolls back, explicitly or by being dropped open
    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.on_rollback.push(Box::new(hook));
    }

    /// Hand the staged writes to the committing store
    pub fn take_writes(&mut self) -> Vec<Write> {
        std::mem::take(&mut self.writes)
    }

    /// Mark the transaction committed and run its commit hooks.
    ///
    /// Called by store implementations once the writes are durable.
    pub fn finish_commit(&mut self) {
        if !self.is_open() {
            return;
        }
        self.state = TransactionState::Committed;
        self.writes.clear();
        self.on_rollback.clear();
        for hook in std::mem::take(&mut self.on_commit) {
            hook();
        }
    }

    /// Discard staged writes and run rollback hooks
    pub fn rollback(&mut self) {
        if !self.is_open() {
            return;
        }
        self.state = TransactionState::RolledBack;
        self.writes.clear();
        self.on_commit.clear();
        for hook in std::mem::take(&mut self.on_rollback) {
            hook();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use courier_common::Priority;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        (count, move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_commit_runs_commit_hooks_only() {
        let mut tx = Transaction::begin(StoreId::next());
        let (committed, on_commit) = counter();
        let (rolled_back, on_rollback) = counter();
        tx.on_commit(on_commit);
        tx.on_rollback(on_rollback);

        tx.finish_commit();
        tx.rollback();
        drop(tx);

        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let owner = StoreId::next();
        let mut tx = Transaction::begin(owner);
        let (rolled_back, on_rollback) = counter();
        tx.on_rollback(on_rollback);
        tx.stage(Write::Delete(JobRecordId::generate()));

        drop(tx);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_and_foreign() {
        let owner = StoreId::next();
        let mut tx = Transaction::begin(owner);
        assert!(tx.ensure_usable(owner).is_ok());
        assert!(matches!(
            tx.ensure_usable(StoreId::next()),
            Err(StoreError::ForeignTransaction(_))
        ));

        tx.rollback();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(matches!(
            tx.ensure_usable(owner),
            Err(StoreError::TransactionClosed(id)) if id == tx.id()
        ));
    }

    #[test]
    fn test_staged_record_reads_latest_write() {
        let mut tx = Transaction::begin(StoreId::next());
        let mut record = JobRecord::new(Vec::new(), Priority::Normal);
        let id = record.id;

        assert_eq!(tx.staged_record(&id), None);

        tx.stage(Write::Insert(record.clone()));
        record.failure_count = 3;
        tx.stage(Write::Update(record.clone()));
        assert_eq!(tx.staged_record(&id), Some(Some(&record)));

        tx.stage(Write::Delete(id));
        assert_eq!(tx.staged_record(&id), Some(None));
        assert_eq!(tx.staged().len(), 3);
    }
}
