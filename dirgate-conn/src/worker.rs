//! Handing operations off to whatever executes them.
//!
//! The dispatcher doesn't run operations itself.  It wraps each admitted operation in a [`Job`]
//! and submits it to a [`WorkerSubmitter`].  The submitter decides where and when the job runs,
//! and may refuse it (for example because it's saturated), in which case the dispatcher rolls the
//! admission back.
//!
//! [`TaskPool`] is the stock submitter: it runs jobs as tasks on a tokio runtime, against a
//! shared [`Backend`].
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::backend::Backend;
use crate::config::WorkerPoolConfig;
use crate::connection::ClientConnection;
use crate::error::panic_err_to_string;
use crate::operation::Operation;
use crate::types::ResultCode;
use crate::DirError;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("The worker pool is saturated")]
    Saturated,

    #[error("The worker pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One admitted operation, ready to execute.
///
/// Running the job executes the operation against a backend and delivers the outcome back to
/// the connection.  A job that is dropped without running leaves its operation pending until
/// the connection is disconnected, so submitters that accept a job must run it.
pub struct Job {
    operation: Arc<Operation>,
    connection: Arc<ClientConnection>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("connection_id", &self.connection.id())
            .field("message_id", &self.operation.message_id())
            .field("operation", &self.operation.kind())
            .finish()
    }
}

impl Job {
    pub(crate) fn new(operation: Arc<Operation>, connection: Arc<ClientConnection>) -> Self {
        Self { operation, connection }
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Execute the operation and deliver its outcome.
    ///
    /// A panic in the backend is caught here and delivered as an `OperationsError` failure, so
    /// one misbehaving operation can't take its worker down or leave its promise hanging.
    pub async fn run(self, backend: &dyn Backend) {
        let Job { operation, connection } = self;
        let message_id = operation.message_id();

        tracing::trace!("Executing operation");

        let result = AssertUnwindSafe(operation.execute(backend, &connection))
            .catch_unwind()
            .await;

        let delivered = match result {
            Ok(Ok(result)) => connection.deliver_result(message_id, result),
            Ok(Err(e)) => connection.deliver_error(message_id, e),
            Err(panic) => {
                let message = panic_err_to_string(panic);
                tracing::error!(%message,
                    "Operation panicked during execution");
                connection.deliver_error(
                    message_id,
                    DirError::OperationFailed {
                        code: ResultCode::OperationsError,
                        message,
                    },
                )
            }
        };

        if !delivered {
            tracing::trace!("Operation was no longer pending when execution finished");
        }
    }

    fn span(&self) -> tracing::Span {
        tracing::debug_span!("operation",
            connection_id = %self.connection.id(),
            message_id = %self.operation.message_id(),
            operation = %self.operation.kind())
    }
}

/// Accepts jobs for execution.
///
/// `submit` must not block, and must not run the job inline: the dispatcher may be called from
/// a context where neither is acceptable.
pub trait WorkerSubmitter: Send + Sync + 'static {
    fn submit(&self, job: Job) -> Result<(), SubmitError>;
}

/// Runs jobs as tokio tasks against a shared backend.
pub struct TaskPool {
    backend: Arc<dyn Backend>,
    runtime: Handle,
    permits: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl TaskPool {
    pub fn new(backend: Arc<dyn Backend>, config: WorkerPoolConfig, runtime: Handle) -> Self {
        Self {
            backend,
            runtime,
            permits: config
                .max_in_flight
                .map(|max_in_flight| Arc::new(Semaphore::new(max_in_flight))),
            tracker: TaskTracker::new(),
        }
    }

    /// Number of jobs currently running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new jobs.  Jobs already running are unaffected.
    pub fn close(&self) {
        self.tracker.close();
        if let Some(permits) = &self.permits {
            permits.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Stop accepting new jobs, and wait for the running ones to finish
    pub async fn shutdown(&self) {
        self.close();
        self.tracker.wait().await;
    }
}

impl WorkerSubmitter for TaskPool {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        if self.tracker.is_closed() {
            return Err(SubmitError::ShuttingDown);
        }

        let permit = match &self.permits {
            Some(permits) => match permits.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => return Err(SubmitError::Saturated),
                Err(TryAcquireError::Closed) => return Err(SubmitError::ShuttingDown),
            },
            None => None,
        };

        let backend = self.backend.clone();
        let span = job.span();

        self.tracker.spawn_on(
            async move {
                job.run(backend.as_ref()).await;
                drop(permit);
            }
            .instrument(span),
            &self.runtime,
        );

        Ok(())
    }
}
