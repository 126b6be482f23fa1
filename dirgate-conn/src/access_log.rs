//! The access log: one record when a connection goes away, and optionally one per completed
//! request.
//!
//! Rendering and storage belong to whoever implements [`AccessLogger`].  The default,
//! [`TracingAccessLog`], emits each record as a `tracing` event on the `dirgate::access` target so
//! it can be routed separately from the diagnostic logs.
use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::DisconnectReason;
use crate::types::{ConnectionId, MessageId, OperationKind, ResultCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRecord {
    pub connection_id: ConnectionId,
    pub client_address: SocketAddr,
    pub reason: DisconnectReason,
    pub message: Option<String>,
    /// Operations that were still pending and were cancelled by the disconnect
    pub operations_cancelled: usize,
    pub operations_performed: u64,
    pub connected_for: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub connection_id: ConnectionId,
    pub message_id: MessageId,
    pub operation: OperationKind,
    pub result_code: ResultCode,
    pub elapsed: Duration,
}

pub trait AccessLogger: Send + Sync + 'static {
    /// Called exactly once per connection, by whichever caller performed the disconnect
    fn log_disconnect(&self, record: &DisconnectRecord);

    fn log_request(&self, record: &RequestRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLogger for TracingAccessLog {
    fn log_disconnect(&self, record: &DisconnectRecord) {
        tracing::info!(target: "dirgate::access",
            connection_id = %record.connection_id,
            client_address = %record.client_address,
            reason = %record.reason,
            message = record.message.as_deref().unwrap_or(record.reason.closure_message()),
            operations_cancelled = record.operations_cancelled,
            operations_performed = record.operations_performed,
            connected_for = %humantime::format_duration(record.connected_for),
            "DISCONNECT");
    }

    fn log_request(&self, record: &RequestRecord) {
        tracing::info!(target: "dirgate::access",
            connection_id = %record.connection_id,
            message_id = %record.message_id,
            operation = %record.operation,
            result_code = record.result_code.as_int(),
            elapsed_ms = record.elapsed.as_millis() as u64,
            "RESULT");
    }
}
