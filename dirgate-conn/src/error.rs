use std::net::IpAddr;

use thiserror::Error;

use crate::operation::CancelReason;
use crate::types::{MessageId, ResultCode};
use crate::worker::SubmitError;

pub type Result<T, E = DirError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DirError {
    /// The connection is draining or closed and no longer admits new operations
    #[error("The connection is being disconnected; no new operations are accepted")]
    DisconnectInProgress,

    #[error("The connection already has the maximum of {limit} operations in progress")]
    AdminLimitExceeded { limit: usize },

    #[error("The worker pool could not accept the operation")]
    WorkerSubmissionFailed {
        #[source]
        source: SubmitError,
    },

    #[error("Operation was cancelled: {reason}")]
    OperationCancelled { reason: CancelReason },

    /// An operation with this message ID is already in progress.  Message IDs are allocated
    /// from a monotonic counter, so this means internal state is corrupt.
    #[error("BUG: an operation with message ID {message_id} is already in progress")]
    DuplicateOperationId { message_id: MessageId },

    #[error("Operation failed with result code {code}: {message}")]
    OperationFailed { code: ResultCode, message: String },

    #[error("Connections from {address} are not allowed")]
    ConnectionRejected { address: IpAddr },

    /// An internal invariant was violated, such as a promise whose resolver was dropped
    /// without ever resolving it
    #[error("BUG: {message}")]
    Bug { message: String },
}

impl DirError {
    /// The result code the front-end should report to the client for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            DirError::DisconnectInProgress => ResultCode::UnwillingToPerform,
            DirError::AdminLimitExceeded { .. } => ResultCode::AdminLimitExceeded,
            DirError::WorkerSubmissionFailed { .. } => ResultCode::OperationsError,
            DirError::OperationCancelled { .. } => ResultCode::Cancelled,
            DirError::DuplicateOperationId { .. } => ResultCode::ProtocolError,
            DirError::OperationFailed { code, .. } => *code,
            DirError::ConnectionRejected { .. } => ResultCode::ConstraintViolation,
            DirError::Bug { .. } => ResultCode::OperationsError,
        }
    }

    /// True if this error means the operation was cancelled or refused because the connection
    /// is going away, as opposed to the backend having failed the request.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            DirError::OperationCancelled { .. } | DirError::DisconnectInProgress
        )
    }
}

impl From<CancelReason> for DirError {
    fn from(reason: CancelReason) -> Self {
        DirError::OperationCancelled { reason }
    }
}

/// Convert the payload of a caught panic into a string that can be logged or reported.
pub(crate) fn panic_err_to_string(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
