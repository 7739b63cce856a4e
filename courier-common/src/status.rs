use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted lifecycle state of a job record.
///
/// Success is not a state: a record that completes is deleted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for dispatch, possibly behind an armed retry timer
    Ready,
    /// An attempt is in flight
    Executing,
    /// Terminal: no further attempts will be made
    PermanentlyFailed,
}

impl JobStatus {
    pub const ALL: [Self; 3] = [Self::Ready, Self::Executing, Self::PermanentlyFailed];

    /// Checks if no further attempts will be made for a record in this state
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::PermanentlyFailed)
    }

    /// Checks if `next` is a legal successor of this state.
    ///
    /// `Executing -> Ready` covers both a retryable failure and recovery of a
    /// record that was in flight when the process died.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Ready, Self::Executing)
                | (Self::Executing, Self::Ready | Self::PermanentlyFailed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::PermanentlyFailed => "permanently-failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "failed" | "permanently-failed" | "permanentlyfailed" => Ok(Self::PermanentlyFailed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Lane selector. Priority chooses a lane; it never reorders within one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub const ALL: [Self; 2] = [Self::High, Self::Normal];
}

impl Display for Priority {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Normal => fmt.write_str("normal"),
            Self::High => fmt.write_str("high"),
        }
    }
}
