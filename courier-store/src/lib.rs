//! Durable, transactional storage of job records
//!
//! The queue only relies on the [`JobRecordStore`] contract: atomic commits of
//! staged writes, lookup by id and lookup by status in insertion order.

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod transaction;
pub mod types;

pub use backends::{FileJobRecordStore, MemoryJobRecordStore, TestJobRecordStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError};
pub use r#trait::JobRecordStore;
pub use transaction::{StoreId, Transaction, TransactionState, Write};
pub use types::{JobRecord, JobRecordId};
