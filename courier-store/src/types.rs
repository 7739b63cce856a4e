use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_common::{JobStatus, Priority};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{SerializationError, StoreError};

/// Identifier for a job record
///
/// A ULID, so identifiers are unique without coordination. Ordering between
/// records is decided by [`JobRecord::insertion_order`], not by the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobRecordId {
    id: ulid::Ulid,
}

impl JobRecordId {
    /// Create a record ID from a ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new unique record ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Parse a record ID from its canonical string form
    pub fn parse(value: &str) -> Option<Self> {
        ulid::Ulid::from_string(value.trim())
            .ok()
            .map(|id| Self { id })
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }
}

impl std::fmt::Display for JobRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl serde::Serialize for JobRecordId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for JobRecordId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// A persisted unit of pending work plus its retry bookkeeping.
///
/// The payload is a reference sufficient to rebuild the work item, encoded
/// with bincode. It should never be content that is mutable elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobRecordId,
    pub status: JobStatus,
    /// Incremented once per observed failure, never decremented
    pub failure_count: u32,
    pub payload: Vec<u8>,
    pub priority: Priority,
    /// FIFO key within a lane, assigned by the store on insert
    pub insertion_order: u64,
    /// Unix timestamp (milliseconds) at which an armed retry becomes due
    pub next_attempt_at_ms: Option<u64>,
    /// Display form of the most recent worker error
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Create a ready record around an already-encoded payload
    #[must_use]
    pub fn new(payload: Vec<u8>, priority: Priority) -> Self {
        Self {
            id: JobRecordId::generate(),
            status: JobStatus::Ready,
            failure_count: 0,
            payload,
            priority,
            insertion_order: 0,
            next_attempt_at_ms: None,
            last_error: None,
        }
    }

    /// Create a ready record by encoding `item` as its payload
    ///
    /// # Errors
    /// If the item cannot be serialized
    pub fn encode<T: Serialize>(
        item: &T,
        priority: Priority,
    ) -> Result<Self, SerializationError> {
        let payload = bincode::serde::encode_to_vec(item, bincode::config::standard())?;
        Ok(Self::new(payload, priority))
    }

    /// Rebuild the work item this record refers to
    ///
    /// # Errors
    /// If the payload is not a valid encoding of `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        let (item, read) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())?;

        if read == self.payload.len() {
            Ok(item)
        } else {
            Err(SerializationError::Corrupted(format!(
                "{} trailing bytes after payload of record {}",
                self.payload.len() - read,
                self.id
            )))
        }
    }

    /// Move the record to `next`, enforcing the status state machine
    ///
    /// # Errors
    /// If `next` is not a legal successor of the current status
    pub fn transition(&mut self, next: JobStatus) -> Result<(), StoreError> {
        if self.status.can_transition_to(next) {
            self.status = next;
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            })
        }
    }

    /// Arm (or clear) the persisted retry time, `delay` from now
    pub fn set_next_attempt_in(&mut self, delay: Option<Duration>) {
        self.next_attempt_at_ms = delay.map(|delay| {
            now_ms().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
        });
    }

    /// How long until the armed retry is due, if it is still in the future
    #[must_use]
    pub fn retry_due_in(&self, now_ms: u64) -> Option<Duration> {
        self.next_attempt_at_ms
            .filter(|due| *due > now_ms)
            .map(|due| Duration::from_millis(due - now_ms))
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
