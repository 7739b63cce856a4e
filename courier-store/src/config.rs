use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::{FileJobRecordStore, MemoryJobRecordStore, Result, r#trait::JobRecordStore};

const DEFAULT_PATH: &str = "/var/lib/courier";

/// Configuration for the job record store
///
/// Selects the store implementation at runtime.
///
/// # Examples
///
/// File-backed store in RON config:
/// ```ron
/// Courier (
///     store: File(
///         path: "/var/lib/courier",
///     ),
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// Courier (
///     store: Memory(
///         capacity: Some(1000),
///     ),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    /// Snapshot-on-commit store (production)
    File {
        path: PathBuf,
        /// Maximum number of records to hold (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
    /// Memory store (testing/development); nothing survives a restart
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from(DEFAULT_PATH),
            capacity: None,
        }
    }
}

impl StoreConfig {
    /// The snapshot directory for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Open the configured store
    ///
    /// # Errors
    /// If a file-backed store cannot create its directory or read its snapshot
    pub async fn into_store(self) -> Result<Arc<dyn JobRecordStore>> {
        match self {
            Self::File { path, capacity } => {
                let store = FileJobRecordStore::open_with_capacity(path, capacity).await?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => Ok(capacity.map_or_else(
                || Arc::new(MemoryJobRecordStore::new()) as Arc<dyn JobRecordStore>,
                |capacity| Arc::new(MemoryJobRecordStore::with_capacity(capacity)),
            )),
        }
    }
}
