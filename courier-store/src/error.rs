//! Error types for the courier-store crate.

use std::io;

use courier_common::JobStatus;
use thiserror::Error;

use crate::JobRecordId;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (snapshot read/write/rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Record not found in the store.
    #[error("Job record not found: {0}")]
    NotFound(JobRecordId),

    /// Record already exists in the store.
    #[error("Job record already exists: {0}")]
    AlreadyExists(JobRecordId),

    /// The transaction was already committed or rolled back.
    #[error("Transaction {0} is closed")]
    TransactionClosed(u64),

    /// The transaction was begun on a different store.
    #[error("Transaction {0} does not belong to this store")]
    ForeignTransaction(u64),

    /// A write would move a record along an edge the status machine forbids.
    #[error("Job record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobRecordId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Store capacity reached.
    #[error("Store capacity exceeded: {used}/{capacity} records")]
    CapacityExceeded { used: usize, capacity: usize },

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Data is corrupted or incomplete.
    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
