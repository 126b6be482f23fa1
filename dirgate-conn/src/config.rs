//! Configuration for connections and the worker pool.
use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// The maximum number of operations that can be in progress on a single connection at any
    /// given time.
    ///
    /// Once this many operations are pending, new submissions are rejected with
    /// [`crate::DirError::AdminLimitExceeded`] until some of them complete.
    ///
    /// `None` indicates no limit
    pub max_concurrent_operations: Option<usize>,

    /// Whether to maintain the per-connection [`crate::ConnectionStats`] counters.
    pub keep_stats: bool,

    /// Whether to emit an access log record for every completed request, in addition to the one
    /// record that is always emitted when the connection disconnects.
    pub log_completed_requests: bool,

    /// How long a connection with no operations in progress may sit idle before
    /// [`crate::ConnectionRegistry::disconnect_idle`] disconnects it.
    ///
    /// `None` indicates no limit.
    #[serde(with = "humantime_serde")]
    pub idle_time_limit: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: None,
            keep_stats: true,
            log_completed_requests: false,
            idle_time_limit: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// The maximum number of operations the pool will execute concurrently, across all
    /// connections.  Submissions beyond this are refused with
    /// [`crate::SubmitError::Saturated`] rather than queued.
    ///
    /// `None` indicates no limit
    pub max_in_flight: Option<usize>,
}
