//! Per-connection counters.
//!
//! All of these are plain relaxed atomics.  They're for monitoring, and nothing synchronizes on
//! them.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};

use crate::types::OperationKind;

#[derive(Debug)]
pub struct ConnectionStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    requests_by_kind: [AtomicU64; OperationKind::COUNT],
    operations_completed: AtomicU64,
    abandoned_operations: AtomicU64,
    disconnects: AtomicU64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            requests_by_kind: std::array::from_fn(|_| AtomicU64::new(0)),
            operations_completed: AtomicU64::new(0),
            abandoned_operations: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
        }
    }

    /// Account for bytes received from the client.  Called by the transport, which is the only
    /// thing that knows about bytes.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_request(&self, kind: OperationKind) {
        self.requests_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.abandoned_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, kind: OperationKind) -> u64 {
        self.requests_by_kind[kind.index()].load(Ordering::Relaxed)
    }

    /// A point-in-time copy of every counter.  The counters are read one at a time, so the
    /// snapshot isn't atomic as a whole.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            requests_by_kind: OperationKind::iter()
                .map(|kind| (<&'static str>::from(kind), self.requests(kind)))
                .filter(|(_, count)| *count > 0)
                .collect(),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            abandoned_operations: self.abandoned_operations.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Request counts keyed by operation name, omitting kinds with no requests
    pub requests_by_kind: Vec<(&'static str, u64)>,
    pub operations_completed: u64,
    pub abandoned_operations: u64,
    pub disconnects: u64,
}

impl StatsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.requests_by_kind.iter().map(|(_, count)| count).sum()
    }
}
