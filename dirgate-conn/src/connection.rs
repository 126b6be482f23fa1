//! The lifecycle of a single client connection, from the operations' point of view.
//!
//! A [`ClientConnection`] owns the table of operations in progress and enforces the disconnect
//! state machine:
//!
//! ```text
//!   Accepting ──disconnect()──▶ Draining ──sweep + teardown──▶ Closed
//! ```
//!
//! The transitions are one-way.  Only the first call to [`ClientConnection::disconnect`] drives
//! them; any concurrent or later call returns immediately.  Once draining has begun no operation
//! is admitted, every operation that was pending is cancelled exactly once, and the table ends up
//! empty.
//!
//! Results come in through the delivery methods (see the `delivery` module), new operations
//! through [`crate::OperationDispatcher`].
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::access_log::{AccessLogger, DisconnectRecord};
use crate::operation::{CancelReason, Operation};
use crate::pending::{PendingOperationTable, PendingRecord};
use crate::registry::ConnectionRegistry;
use crate::stats::ConnectionStats;
use crate::types::{ConnectionId, Dn, MessageId, ResultCode};
use crate::{ConnectionConfig, DirError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    /// Operations are admitted
    Accepting = 0,
    /// A disconnect is in progress; nothing new is admitted and pending work is being cancelled
    Draining = 1,
    /// Terminal
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Accepting,
            1 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// The generic cause of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectReason {
    /// The client unbound or closed the connection
    ClientDisconnect,
    ProtocolError,
    ServerShutdown,
    ServerError,
    AdminLimitExceeded,
    IdleTimeLimitExceeded,
    IoError,
    ConnectionRejected,
    InvalidCredentials,
    Other,
}

impl DisconnectReason {
    /// Human-readable description, used as the message of the cancellations a disconnect causes
    pub fn closure_message(&self) -> &'static str {
        match self {
            DisconnectReason::ClientDisconnect => "The client closed the connection",
            DisconnectReason::ProtocolError => "The connection was closed because of a protocol error",
            DisconnectReason::ServerShutdown => "The server is shutting down",
            DisconnectReason::ServerError => "The connection was closed because of an internal server error",
            DisconnectReason::AdminLimitExceeded => "The connection exceeded an administrative limit",
            DisconnectReason::IdleTimeLimitExceeded => "The connection exceeded the idle time limit",
            DisconnectReason::IoError => "The connection was closed because of an I/O error",
            DisconnectReason::ConnectionRejected => "The connection was rejected",
            DisconnectReason::InvalidCredentials => "The connection was closed because of invalid credentials",
            DisconnectReason::Other => "The connection was closed",
        }
    }

    /// Result code for a notice of disconnection sent to the client, if the transport can send
    /// one
    pub fn result_code(&self) -> ResultCode {
        match self {
            DisconnectReason::ProtocolError => ResultCode::ProtocolError,
            DisconnectReason::ServerShutdown => ResultCode::Unavailable,
            DisconnectReason::ServerError => ResultCode::OperationsError,
            DisconnectReason::AdminLimitExceeded
            | DisconnectReason::IdleTimeLimitExceeded
            | DisconnectReason::IoError => ResultCode::AdminLimitExceeded,
            DisconnectReason::ConnectionRejected => ResultCode::ConstraintViolation,
            DisconnectReason::InvalidCredentials => ResultCode::InvalidCredentials,
            DisconnectReason::ClientDisconnect | DisconnectReason::Other => ResultCode::Other,
        }
    }
}

/// Where a connection comes from and goes to, as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client_address: SocketAddr,
    pub server_address: SocketAddr,
    /// Name of the transport protocol, for logging
    pub protocol: String,
}

/// One client connection's operation lifecycle.
///
/// Always used behind an `Arc`; create it with [`ClientConnection::open`].  Shared by the
/// dispatching thread, every worker delivering results for its operations, and whoever ends up
/// calling [`Self::disconnect`].
pub struct ClientConnection {
    id: ConnectionId,
    info: ConnectionInfo,
    config: ConnectionConfig,
    registry: Arc<ConnectionRegistry>,
    access_log: Arc<dyn AccessLogger>,

    pending: PendingOperationTable,

    state: AtomicU8,

    /// Cleared exactly once, by the disconnect.  Read without the table lock by streaming
    /// searches deciding whether to keep going.
    connection_valid: AtomicBool,

    /// Parent of every operation's cancellation token, so that anything still running when the
    /// connection closes sees the signal even if it was never swept
    cancellation_token: CancellationToken,

    operations_performed: AtomicU64,
    stats: ConnectionStats,

    bound_dn: Mutex<Option<Dn>>,
    connected_at: SystemTime,
    connected_instant: Instant,
    last_completion: Mutex<Instant>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("client_address", &self.info.client_address)
            .field("state", &self.state())
            .field("operations_in_progress", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Open a new connection and register it with `registry`.
    ///
    /// Fails with [`DirError::ConnectionRejected`] if the registry's address filter refuses the
    /// client address, in which case nothing is registered.
    pub fn open(
        registry: Arc<ConnectionRegistry>,
        info: ConnectionInfo,
        config: ConnectionConfig,
        access_log: Arc<dyn AccessLogger>,
    ) -> Result<Arc<Self>> {
        let client_ip = info.client_address.ip();
        if !registry.is_allowed(&client_ip) {
            tracing::info!(client_address = %info.client_address,
                "Rejecting connection from disallowed address");
            return Err(DirError::ConnectionRejected { address: client_ip });
        }

        let now = Instant::now();
        let connection = Arc::new(Self {
            id: registry.next_connection_id(),
            pending: PendingOperationTable::new(config.max_concurrent_operations),
            info,
            config,
            registry: registry.clone(),
            access_log,
            state: AtomicU8::new(ConnectionState::Accepting as u8),
            connection_valid: AtomicBool::new(true),
            cancellation_token: CancellationToken::new(),
            operations_performed: AtomicU64::new(0),
            stats: ConnectionStats::new(),
            bound_dn: Mutex::new(None),
            connected_at: SystemTime::now(),
            connected_instant: now,
            last_completion: Mutex::new(now),
        });

        registry.register(&connection);

        tracing::debug!(connection_id = %connection.id,
            client_address = %connection.info.client_address,
            protocol = %connection.info.protocol,
            "Connection opened");

        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `false` once a disconnect has started.  Streaming producers check this to decide whether
    /// to keep going.
    pub fn is_connection_valid(&self) -> bool {
        self.connection_valid.load(Ordering::Acquire)
    }

    /// Number of operations that reached a terminal result through normal delivery (cancelled
    /// operations are not counted)
    pub fn operations_performed(&self) -> u64 {
        self.operations_performed.load(Ordering::Relaxed)
    }

    /// The operations currently in progress, ordered by message ID
    pub fn operations_in_progress(&self) -> Vec<Arc<Operation>> {
        self.pending.operations()
    }

    pub fn operation_in_progress(&self, message_id: MessageId) -> Option<Arc<Operation>> {
        self.pending
            .get(message_id)
            .map(|record| record.operation().clone())
    }

    pub fn num_operations_in_progress(&self) -> usize {
        self.pending.len()
    }

    /// The DN of the last successful bind on this connection, if any
    pub fn bound_dn(&self) -> Option<Dn> {
        self.bound_dn.lock().clone()
    }

    pub(crate) fn set_bound_dn(&self, dn: Option<Dn>) {
        *self.bound_dn.lock() = dn;
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub(crate) fn access_log(&self) -> &dyn AccessLogger {
        self.access_log.as_ref()
    }

    /// How long the connection has been without any operation in progress.  Zero while anything
    /// is pending.
    pub fn idle_time(&self) -> Duration {
        if self.pending.is_empty() {
            self.last_completion.lock().elapsed()
        } else {
            Duration::ZERO
        }
    }

    pub(crate) fn touch_last_completion(&self) {
        *self.last_completion.lock() = Instant::now();
    }

    pub(crate) fn record_operation_performed(&self) {
        self.operations_performed.fetch_add(1, Ordering::Relaxed);
    }

    /// Admit a new operation into the pending table.
    pub(crate) fn admit(&self, record: Arc<PendingRecord>) -> Result<()> {
        self.pending.insert(record)
    }

    /// Take a record out of the pending table, making the caller responsible for resolving it
    pub(crate) fn withdraw(&self, message_id: MessageId) -> Option<Arc<PendingRecord>> {
        self.pending.remove(message_id)
    }

    pub(crate) fn pending_record(&self, message_id: MessageId) -> Option<Arc<PendingRecord>> {
        self.pending.get(message_id)
    }

    /// Disconnect this connection.
    ///
    /// Idempotent and safe to call from any number of threads at once: the first caller performs
    /// the whole sequence below, everyone else returns immediately.
    ///
    /// 1. Stop admitting operations (under the table lock, so no insert can sneak in after)
    /// 2. Mark the connection invalid so streaming searches stop
    /// 3. Cancel every pending operation, resolving its promise as cancelled
    /// 4. Cancel the connection's token, which every operation's token descends from
    /// 5. Unregister from the registry, and emit exactly one disconnect record
    ///
    /// When this returns to the first caller the connection is `Closed` and the table is empty.
    pub fn disconnect(&self, reason: DisconnectReason, message: Option<String>) {
        if !self.pending.begin_disconnect() {
            tracing::trace!(connection_id = %self.id,
                %reason,
                "Disconnect already in progress; ignoring");
            return;
        }

        self.state.store(ConnectionState::Draining as u8, Ordering::Release);
        self.connection_valid.store(false, Ordering::Release);

        tracing::info!(connection_id = %self.id,
            client_address = %self.info.client_address,
            %reason,
            num_pending_operations = self.pending.len(),
            "Disconnecting; cancelling all pending operations");

        if self.config.keep_stats {
            self.stats.record_disconnect();
        }

        let operations_cancelled = self.cancel_all(CancelReason::Disconnect {
            reason,
            message: message.as_deref().map(Arc::from),
        });

        self.cancellation_token.cancel();
        self.registry.unregister(self.id);
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);

        let record = DisconnectRecord {
            connection_id: self.id,
            client_address: self.info.client_address,
            reason,
            message,
            operations_cancelled,
            operations_performed: self.operations_performed(),
            connected_for: self.connected_instant.elapsed(),
        };
        self.access_log.log_disconnect(&record);
    }

    /// Cancel every operation in progress.
    ///
    /// Each one is aborted (so a worker executing it sees the signal at its next checkpoint) and
    /// its promise resolved as cancelled.  Returns how many were cancelled.
    ///
    /// This doesn't stop new operations from being admitted afterwards; only
    /// [`Self::disconnect`] does that.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let records = self.pending.drain_all();
        self.cancel_records(records, &reason)
    }

    /// Cancel every operation in progress except `message_id`.
    ///
    /// The excepted operation stays in the table throughout, so it remains visible to lookups
    /// and deliveries for the whole sweep, and is never resolved by it.
    pub fn cancel_all_except(&self, message_id: MessageId, reason: CancelReason) -> usize {
        let records = self.pending.drain_all_except(message_id);
        self.cancel_records(records, &reason)
    }

    /// Cancel one operation.
    ///
    /// Returns `Cancelled` if it was pending and has now been cancelled, `NoSuchOperation` if it
    /// wasn't pending (never existed, already completed, or already cancelled), and
    /// `CannotCancel` if it is pending but of a kind that can't be abandoned.
    pub fn cancel_operation(&self, message_id: MessageId, reason: CancelReason) -> ResultCode {
        if let Some(record) = self.pending.get(message_id) {
            let kind = record.operation().kind();
            if !kind.is_cancellable() {
                tracing::debug!(connection_id = %self.id,
                    %message_id,
                    operation = %kind,
                    "Refusing to cancel operation");
                return ResultCode::CannotCancel;
            }
        }

        match self.pending.remove(message_id) {
            Some(record) => {
                self.cancel_records(vec![record], &reason);
                ResultCode::Cancelled
            }
            None => {
                tracing::debug!(connection_id = %self.id,
                    %message_id,
                    "Tried to cancel an operation that is not in progress");
                ResultCode::NoSuchOperation
            }
        }
    }

    /// Abort and resolve records that have already been removed from the table
    fn cancel_records(&self, records: Vec<Arc<PendingRecord>>, reason: &CancelReason) -> usize {
        if records.is_empty() {
            return 0;
        }

        let mut cancelled = 0;
        for record in records {
            let operation = record.operation();
            operation.abort(reason.clone());

            if record.resolve(Err(DirError::OperationCancelled { reason: reason.clone() })) {
                cancelled += 1;
                if self.config.keep_stats {
                    self.stats.record_abandoned();
                }
            }

            tracing::trace!(connection_id = %self.id,
                message_id = %operation.message_id(),
                operation = %operation.kind(),
                %reason,
                "Cancelled pending operation");
        }

        self.touch_last_completion();
        cancelled
    }

    /// One-line summary of this connection, for monitoring
    pub fn monitor_summary(&self) -> String {
        let connect_time = humantime::format_rfc3339_seconds(self.connected_at);
        format!(
            "connID=\"{}\" connectTime=\"{}\" source=\"{}\" destination=\"{}\" protocol=\"{}\" \
             authDN=\"{}\" state=\"{}\" opsInProgress=\"{}\" opsCompleted=\"{}\"",
            self.id,
            connect_time,
            self.info.client_address,
            self.info.server_address,
            self.info.protocol,
            self.bound_dn().map(|dn| dn.to_string()).unwrap_or_default(),
            self.state(),
            self.pending.len(),
            self.operations_performed(),
        )
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        // A connection abandoned by its transport still resolves every pending promise
        if self.state() != ConnectionState::Closed {
            self.disconnect(DisconnectReason::Other, Some("Connection dropped".to_string()));
        }
    }
}
