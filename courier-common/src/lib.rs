pub mod logging;
pub mod status;

pub use status::{JobStatus, ParseStatusError, Priority};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
