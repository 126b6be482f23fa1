//! A single client-requested unit of work, and the cooperative cancellation machinery attached
//! to it.
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, SearchSink};
use crate::connection::{ClientConnection, DisconnectReason};
use crate::types::{ConnectionId, MessageId, OperationKind, OperationResult, Request};
use crate::{DirError, Result};

/// Why an operation was cancelled.
///
/// This is what a cancelled operation's promise carries in [`DirError::OperationCancelled`], and
/// what [`Operation::checkpoint`] reports to code that polls for cancellation between phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The client abandoned this specific operation
    Abandon,
    /// A bind on the same connection swept all other operations
    Bind,
    /// An unbind on the same connection swept all other operations
    Unbind,
    /// The connection is going away.  `message` is the detail the disconnecting caller gave, if
    /// any.
    Disconnect {
        reason: DisconnectReason,
        message: Option<Arc<str>>,
    },
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Abandon => f.write_str("abandoned by client request"),
            CancelReason::Bind => f.write_str("cancelled by a bind on the same connection"),
            CancelReason::Unbind => f.write_str("cancelled by an unbind on the same connection"),
            CancelReason::Disconnect {
                reason,
                message: Some(message),
            } => write!(f, "{}: {message}", reason.closure_message()),
            CancelReason::Disconnect { reason, message: None } => f.write_str(reason.closure_message()),
        }
    }
}

/// An in-flight operation.
///
/// The request parameters are immutable.  The only mutable state is the cancellation signal,
/// which is set at most once by [`Self::abort`] and observed by whoever is executing the
/// operation.  Results are not stored here; they flow through the connection's delivery methods
/// to the operation's promise.
#[derive(Debug)]
pub struct Operation {
    connection_id: ConnectionId,
    message_id: MessageId,
    request: Request,
    created: Instant,
    cancellation_token: CancellationToken,
    cancel_reason: OnceLock<CancelReason>,
}

impl Operation {
    pub(crate) fn new(
        connection_id: ConnectionId,
        message_id: MessageId,
        request: Request,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            message_id,
            request,
            created: Instant::now(),
            cancellation_token,
            cancel_reason: OnceLock::new(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Time since the operation was created by the dispatcher
    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// The token that is cancelled when this operation is aborted.
    ///
    /// Backends that block on something long-running should `select!` on
    /// [`CancellationToken::cancelled`] rather than polling [`Self::is_cancelled`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// The reason this operation was cancelled, if it was.
    ///
    /// The operation's token is a child of its connection's token, so it can be cancelled
    /// without [`Self::abort`] having been called when the whole connection is torn down.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if let Some(reason) = self.cancel_reason.get() {
            Some(reason.clone())
        } else if self.cancellation_token.is_cancelled() {
            Some(CancelReason::Disconnect {
                reason: DisconnectReason::Other,
                message: None,
            })
        } else {
            None
        }
    }

    /// Signal this operation to stop.
    ///
    /// Cancellation is cooperative: this doesn't interrupt anything, it just sets the signal that
    /// the executing worker checks at its next yield point.  The first reason wins; returns
    /// `false` if the operation was already aborted.
    pub fn abort(&self, reason: CancelReason) -> bool {
        let first = self.cancel_reason.set(reason).is_ok();
        self.cancellation_token.cancel();
        first
    }

    /// A cooperative yield point: `Err` if the operation has been cancelled and execution should
    /// stop.
    pub fn checkpoint(&self) -> Result<(), CancelReason> {
        match self.cancel_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Execute this operation against the backend.
    ///
    /// Called by a worker with a transient reference to the operation.  Unbind and abandon never
    /// reach the backend; they act on the connection itself.  Every other kind is handed to the
    /// corresponding [`Backend`] method, with a cancellation checkpoint before and after.
    pub async fn execute(&self, backend: &dyn Backend, connection: &ClientConnection) -> Result<OperationResult> {
        self.checkpoint()?;

        let outcome = match &self.request {
            Request::Add(request) => backend.add(self, request).await,
            Request::Bind(request) => {
                // A bind resets the connection's identity, so nothing else that was started
                // under the old identity may continue
                connection.cancel_all_except(self.message_id, CancelReason::Bind);
                self.checkpoint()?;

                // The new identity only takes effect if this result is actually delivered, which
                // the delivery path takes care of
                backend.bind(self, request).await
            }
            Request::Compare(request) => backend.compare(self, request).await,
            Request::Delete(request) => backend.delete(self, request).await,
            Request::Extended(request) => backend.extended(self, request).await,
            Request::ModifyDn(request) => backend.modify_dn(self, request).await,
            Request::Modify(request) => backend.modify(self, request).await,
            Request::Search(request) => {
                let sink = SearchSink::new(connection, self);
                backend.search(self, request, &sink).await
            }
            Request::Unbind => {
                // The unbind itself survives the sweep so its own completion can trigger the
                // disconnect
                connection.cancel_all_except(self.message_id, CancelReason::Unbind);
                return Ok(OperationResult::success());
            }
            Request::Abandon { target } => {
                let code = connection.cancel_operation(*target, CancelReason::Abandon);
                return Ok(OperationResult::new(code));
            }
        };

        // If the operation was cancelled while the backend was working, whatever the backend
        // produced is moot
        self.checkpoint()?;

        outcome.map_err(DirError::from)
    }
}
