//! Backend storage implementations for job records
//!
//! - `memory`: In-memory storage for tests and development
//! - `file`: Snapshot-on-commit storage for restart safety
//! - `test`: Test utilities with synchronization primitives and failure injection

pub mod file;
pub mod memory;
pub mod test;

pub use file::FileJobRecordStore;
pub use memory::MemoryJobRecordStore;
pub use test::TestJobRecordStore;
