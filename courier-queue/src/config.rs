use std::time::Duration;

use courier_store::StoreConfig;
use serde::Deserialize;

use crate::policy::RetryPolicy;

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Configuration for a job queue
///
/// # Examples
///
/// ```ron
/// Courier (
///     retry: (
///         max_retries: 110,
///         base_delay_ms: 1000,
///     ),
///     store: File(
///         path: "/var/lib/courier",
///     ),
///     shutdown_timeout_secs: 30,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub store: StoreConfig,

    /// How long `shut_down` waits for in-flight attempts to finish (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            store: StoreConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
