//! Turning decoded requests into running operations.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::connection::ClientConnection;
use crate::operation::Operation;
use crate::pending::PendingRecord;
use crate::promise::{self, ResultPromise};
use crate::types::{MessageId, Request};
use crate::worker::{Job, WorkerSubmitter};
use crate::DirError;

/// Submits operations on behalf of one connection.
///
/// Each submission gets the next message ID, is admitted into the connection's pending table,
/// and is handed to the worker submitter.  Whatever happens, the caller gets back a
/// [`ResultPromise`] that will resolve exactly once; failures to admit or submit resolve it
/// immediately rather than being returned as errors.
pub struct OperationDispatcher {
    connection: Arc<ClientConnection>,
    workers: Arc<dyn WorkerSubmitter>,
    next_message_id: AtomicU32,
}

impl OperationDispatcher {
    pub fn new(connection: Arc<ClientConnection>, workers: Arc<dyn WorkerSubmitter>) -> Self {
        Self {
            connection,
            workers,
            next_message_id: AtomicU32::new(1),
        }
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Submit a request for execution.
    pub fn submit(&self, request: Request) -> ResultPromise {
        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed));
        let connection_id = self.connection.id();
        let kind = request.kind();

        let operation = Arc::new(Operation::new(
            connection_id,
            message_id,
            request,
            self.connection.cancellation_token().child_token(),
        ));
        let (promise, resolver) = promise::pending(message_id, kind);
        let record = Arc::new(PendingRecord::new(operation.clone(), resolver));

        if self.connection.config().keep_stats {
            self.connection.stats().record_request(kind);
        }

        if let Err(e) = self.connection.admit(record.clone()) {
            match &e {
                DirError::DuplicateOperationId { .. } => {
                    tracing::error!(%connection_id,
                        %message_id,
                        operation = %kind,
                        "BUG: Message ID allocated twice on the same connection");
                }
                _ => {
                    tracing::debug!(%connection_id,
                        %message_id,
                        operation = %kind,
                        error = %e,
                        "Operation not admitted");
                }
            }
            record.resolve(Err(e));
            // A refused request is still client activity as far as idle tracking is concerned
            self.connection.touch_last_completion();
            return promise;
        }

        tracing::trace!(%connection_id,
            %message_id,
            operation = %kind,
            "Operation admitted");

        if let Err(e) = self.workers.submit(Job::new(operation, self.connection.clone())) {
            // Roll back the admission.  If the record is already gone, a sweep got to it first
            // and has resolved it as cancelled.
            match self.connection.withdraw(message_id) {
                Some(record) => {
                    tracing::warn!(%connection_id,
                        %message_id,
                        operation = %kind,
                        error = %e,
                        "Worker submission failed");
                    record.resolve(Err(DirError::WorkerSubmissionFailed { source: e }));
                }
                None => {
                    tracing::trace!(%connection_id,
                        %message_id,
                        error = %e,
                        "Worker submission failed for an operation that was already swept");
                }
            }
            self.connection.touch_last_completion();
        }

        promise
    }
}
