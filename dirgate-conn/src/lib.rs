//! The per-connection operation lifecycle for a directory-protocol front-end.
//!
//! A transport (HTTP, in the front-end this was built for) decodes client requests and hands them
//! to an [`OperationDispatcher`], which admits each one into its [`ClientConnection`]'s table of
//! operations in progress and submits it to a worker pool.  Workers execute operations against a
//! [`Backend`] and deliver the outcome back through the connection, which resolves the
//! operation's [`ResultPromise`].
//!
//! The interesting part is what happens when things go away.  Operations can be abandoned
//! individually, swept by a bind or unbind on the same connection, or cancelled wholesale when
//! the connection disconnects.  Whichever way it happens, every operation's promise resolves
//! exactly once, nothing is admitted once a disconnect has started, and a disconnect leaves
//! nothing behind.
//!
//! This crate has no opinion about wire formats, authentication, or what the backend actually
//! does.

/// Re-export the exact async-trait macro we use, for compatibility
#[doc(hidden)]
pub use async_trait::async_trait;

mod access_log;
mod backend;
mod config;
mod connection;
mod delivery;
mod dispatcher;
mod error;
mod operation;
mod pending;
mod promise;
mod registry;
mod stats;
#[cfg(test)]
pub mod testing;
mod types;
mod worker;

pub use access_log::{AccessLogger, DisconnectRecord, RequestRecord, TracingAccessLog};
pub use backend::{Backend, BackendError, BackendResult, SearchSink};
pub use config::{ConnectionConfig, WorkerPoolConfig};
pub use connection::{ClientConnection, ConnectionInfo, ConnectionState, DisconnectReason};
pub use dispatcher::OperationDispatcher;
pub use error::{DirError, Result};
pub use operation::{CancelReason, Operation};
pub use promise::{ResultPromise, SearchResultStream};
pub use registry::{AddressFilter, AllowDenyList, ConnectionRegistry};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use types::{
    AddRequest, Attribute, BindCredentials, BindRequest, CompareRequest, ConnectionId, DeleteRequest, Dn,
    ExtendedRequest, JsonValue, MessageId, Modification, ModificationType, ModifyDnRequest, ModifyRequest,
    OperationKind, OperationResult, Request, ResultCode, SearchEntry, SearchItem, SearchReference, SearchRequest,
    SearchScope,
};
pub use worker::{Job, SubmitError, TaskPool, WorkerSubmitter};
