//! The engine that actually performs directory operations.
//!
//! This core doesn't implement any directory semantics itself.  Workers hand each operation to a
//! [`Backend`], one method per operation kind, and deliver whatever comes back to the
//! operation's promise.
use async_trait::async_trait;

use crate::DirError;
use crate::connection::ClientConnection;
use crate::operation::Operation;
use crate::types::{
    AddRequest, BindRequest, CompareRequest, DeleteRequest, ExtendedRequest, ModifyDnRequest, ModifyRequest,
    OperationResult, ResultCode, SearchEntry, SearchReference, SearchRequest,
};

/// A backend refused or failed to perform an operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: ResultCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BackendError> for DirError {
    fn from(BackendError { code, message }: BackendError) -> Self {
        DirError::OperationFailed { code, message }
    }
}

pub type BackendResult = Result<OperationResult, BackendError>;

fn unsupported(operation: &Operation) -> BackendResult {
    Err(BackendError::new(
        ResultCode::UnwillingToPerform,
        format!("{} operations are not supported by this backend", operation.kind()),
    ))
}

/// Performs directory operations on behalf of workers.
///
/// Every method has a default implementation that refuses the operation with
/// `UnwillingToPerform`, so a backend only needs to implement what it supports.
///
/// Implementations should treat [`Operation::cancellation_token`] as a hint to stop early: if the
/// operation is cancelled while the backend is working, whatever it returns is discarded.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn add(&self, operation: &Operation, _request: &AddRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn bind(&self, operation: &Operation, _request: &BindRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn compare(&self, operation: &Operation, _request: &CompareRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn delete(&self, operation: &Operation, _request: &DeleteRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn extended(&self, operation: &Operation, _request: &ExtendedRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn modify(&self, operation: &Operation, _request: &ModifyRequest) -> BackendResult {
        unsupported(operation)
    }

    async fn modify_dn(&self, operation: &Operation, _request: &ModifyDnRequest) -> BackendResult {
        unsupported(operation)
    }

    /// Run a search, streaming entries and references through `sink` before returning the
    /// terminal result.
    async fn search(
        &self,
        operation: &Operation,
        _request: &SearchRequest,
        _sink: &SearchSink<'_>,
    ) -> BackendResult {
        unsupported(operation)
    }
}

/// Where a search sends its intermediate results.
///
/// Each send reports whether the backend should keep going.  `false` means either the
/// connection is no longer valid or the search is no longer pending (cancelled, or already
/// completed), and the backend should stop producing results.  It's advisory; anything sent
/// after that point is silently dropped.
pub struct SearchSink<'a> {
    connection: &'a ClientConnection,
    operation: &'a Operation,
}

impl<'a> SearchSink<'a> {
    pub(crate) fn new(connection: &'a ClientConnection, operation: &'a Operation) -> Self {
        Self { connection, operation }
    }

    pub fn send_entry(&self, entry: SearchEntry) -> bool {
        self.connection.deliver_entry(self.operation.message_id(), entry)
    }

    pub fn send_reference(&self, reference: SearchReference) -> bool {
        self.connection
            .deliver_reference(self.operation.message_id(), reference)
    }
}
