//! Delivery of results from workers back to the operations' promises.
//!
//! Workers call these on the connection when the backend finishes (or produces an intermediate
//! search item).  A terminal delivery first removes the operation from the pending table, and only
//! resolves the promise if the removal found it.  So a result that arrives after a sweep already
//! cancelled the operation is silently dropped, and the promise keeps the cancellation.  The
//! same goes for the connection-level side effects of a bind or unbind, which only happen once
//! their delivery has won.
use crate::access_log::RequestRecord;
use crate::connection::{ClientConnection, DisconnectReason};
use crate::types::{
    MessageId, OperationKind, OperationResult, Request, ResultCode, SearchEntry, SearchItem, SearchReference,
};
use crate::{DirError, Result};

impl ClientConnection {
    /// Deliver the terminal result of an operation.
    ///
    /// Returns `true` if the operation was still pending and its promise now holds `result`,
    /// `false` if it had already been completed or cancelled.
    pub fn deliver_result(&self, message_id: MessageId, result: OperationResult) -> bool {
        self.complete(message_id, Ok(result))
    }

    /// Deliver a terminal failure of an operation.  Same semantics as [`Self::deliver_result`].
    pub fn deliver_error(&self, message_id: MessageId, error: DirError) -> bool {
        self.complete(message_id, Err(error))
    }

    /// Push a search result entry to the search's result stream.
    ///
    /// Returns `false` when the backend should stop producing: the connection is no longer valid,
    /// or the search is no longer pending.  The entry is dropped in that case.
    pub fn deliver_entry(&self, message_id: MessageId, entry: SearchEntry) -> bool {
        self.push_search_item(message_id, SearchItem::Entry(entry))
    }

    /// Push a search continuation reference.  Same semantics as [`Self::deliver_entry`].
    pub fn deliver_reference(&self, message_id: MessageId, reference: SearchReference) -> bool {
        self.push_search_item(message_id, SearchItem::Reference(reference))
    }

    fn push_search_item(&self, message_id: MessageId, item: SearchItem) -> bool {
        if !self.is_connection_valid() {
            tracing::trace!(connection_id = %self.id(),
                %message_id,
                "Dropping search item for invalid connection");
            return false;
        }

        match self.pending_record(message_id) {
            Some(record) => record.push(item),
            None => {
                tracing::trace!(connection_id = %self.id(),
                    %message_id,
                    "Dropping search item for operation that is no longer pending");
                false
            }
        }
    }

    fn complete(&self, message_id: MessageId, outcome: Result<OperationResult>) -> bool {
        let Some(record) = self.withdraw(message_id) else {
            tracing::trace!(connection_id = %self.id(),
                %message_id,
                outcome = ?outcome,
                "Dropping result for operation that is no longer pending");
            return false;
        };

        let operation = record.operation().clone();
        let kind = operation.kind();
        let result_code = match &outcome {
            Ok(result) => result.code,
            Err(e) => e.result_code(),
        };

        // Past this point nothing can cancel the operation, so the new identity is safe to
        // apply.  Set before resolving so the submitter sees it as soon as the promise resolves.
        if let Request::Bind(request) = operation.request() {
            if result_code == ResultCode::Success {
                self.set_bound_dn(Some(request.dn.clone()));
            }
        }

        if !record.resolve(outcome) {
            // Removal makes the caller the only resolver, so this can't happen unless something
            // resolved the record while it was still in the table
            tracing::error!(connection_id = %self.id(),
                %message_id,
                "BUG: Pending operation was already resolved when removed from the table");
            return false;
        }

        self.record_operation_performed();
        self.touch_last_completion();
        if self.config().keep_stats {
            self.stats().record_completed();
        }

        tracing::trace!(connection_id = %self.id(),
            %message_id,
            operation = %kind,
            %result_code,
            "Operation completed");

        if self.config().log_completed_requests {
            self.access_log().log_request(&RequestRecord {
                connection_id: self.id(),
                message_id,
                operation: kind,
                result_code,
                elapsed: operation.elapsed(),
            });
        }

        if kind == OperationKind::Unbind {
            self.disconnect(DisconnectReason::ClientDisconnect, None);
        }

        true
    }
}
