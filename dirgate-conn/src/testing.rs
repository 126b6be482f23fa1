//! Helpers for testing the operation lifecycle.
//!
//! This module is only compiled when `test` is enabled
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::access_log::{AccessLogger, DisconnectRecord, RequestRecord};
use crate::connection::{ClientConnection, ConnectionInfo};
use crate::operation::Operation;
use crate::pending::PendingRecord;
use crate::promise::{self, ResultPromise};
use crate::registry::{AllowDenyList, ConnectionRegistry};
use crate::types::{
    BindCredentials, BindRequest, DeleteRequest, Dn, MessageId, Request, SearchEntry, SearchRequest, SearchScope,
};
use crate::worker::{Job, SubmitError, WorkerSubmitter};
use crate::ConnectionConfig;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "trace";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init()
            .unwrap()
    });
}

/// Access log that keeps every record in memory
#[derive(Default)]
pub struct RecordingAccessLog {
    disconnects: Mutex<Vec<DisconnectRecord>>,
    requests: Mutex<Vec<RequestRecord>>,
}

impl RecordingAccessLog {
    pub fn disconnects(&self) -> Vec<DisconnectRecord> {
        self.disconnects.lock().clone()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.requests.lock().clone()
    }
}

impl AccessLogger for RecordingAccessLog {
    fn log_disconnect(&self, record: &DisconnectRecord) {
        self.disconnects.lock().push(record.clone());
    }

    fn log_request(&self, record: &RequestRecord) {
        self.requests.lock().push(record.clone());
    }
}

/// Accepts every job and holds on to it without running it
#[derive(Default)]
pub struct RecordingWorkers {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingWorkers {
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn take_jobs(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

impl WorkerSubmitter for RecordingWorkers {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.jobs.lock().push(job);
        Ok(())
    }
}

/// Refuses every job as if saturated
pub struct RejectingWorkers;

impl WorkerSubmitter for RejectingWorkers {
    fn submit(&self, _job: Job) -> Result<(), SubmitError> {
        Err(SubmitError::Saturated)
    }
}

pub fn client_address() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

pub fn connection_info() -> ConnectionInfo {
    ConnectionInfo {
        client_address: client_address(),
        server_address: "192.0.2.1:8080".parse().unwrap(),
        protocol: "HTTP".to_string(),
    }
}

pub fn registry_denying(address: IpAddr) -> Arc<ConnectionRegistry> {
    ConnectionRegistry::with_filter(AllowDenyList {
        allowed: vec![],
        denied: vec![address],
    })
}

pub fn accept(registry: &Arc<ConnectionRegistry>, config: ConnectionConfig) -> Arc<ClientConnection> {
    registry
        .accept(connection_info(), config, Arc::new(RecordingAccessLog::default()))
        .unwrap()
}

pub fn open_test_connection() -> (Arc<ClientConnection>, Arc<RecordingAccessLog>) {
    open_test_connection_with(ConnectionConfig::default())
}

pub fn open_test_connection_with(config: ConnectionConfig) -> (Arc<ClientConnection>, Arc<RecordingAccessLog>) {
    let log = Arc::new(RecordingAccessLog::default());
    let connection = ConnectionRegistry::new()
        .accept(connection_info(), config, log.clone())
        .unwrap();
    (connection, log)
}

/// Admit an operation directly into the connection's pending table, bypassing the dispatcher and
/// workers, so tests control exactly when it completes.
pub fn admit(connection: &ClientConnection, id: u32, request: Request) -> ResultPromise {
    let operation = Arc::new(Operation::new(
        connection.id(),
        MessageId(id),
        request,
        connection.cancellation_token().child_token(),
    ));
    let (promise, resolver) = promise::pending(MessageId(id), operation.kind());
    connection
        .admit(Arc::new(PendingRecord::new(operation, resolver)))
        .unwrap();
    promise
}

pub fn admit_delete(connection: &ClientConnection, id: u32) -> ResultPromise {
    admit(connection, id, Request::Delete(DeleteRequest { dn: "cn=foo".into() }))
}

pub fn admit_search(connection: &ClientConnection, id: u32) -> ResultPromise {
    admit(
        connection,
        id,
        Request::Search(SearchRequest {
            base: "dc=example,dc=com".into(),
            scope: SearchScope::WholeSubtree,
            filter: "(objectClass=*)".to_string(),
            attributes: vec![],
            size_limit: 0,
        }),
    )
}

pub fn admit_bind(connection: &ClientConnection, id: u32, dn: &str) -> ResultPromise {
    admit(
        connection,
        id,
        Request::Bind(BindRequest {
            dn: Dn::new(dn),
            credentials: BindCredentials::Simple {
                password: "secret".to_string(),
            },
        }),
    )
}

pub fn admit_unbind(connection: &ClientConnection, id: u32) -> ResultPromise {
    admit(connection, id, Request::Unbind)
}

pub fn entry(dn: &str) -> SearchEntry {
    SearchEntry {
        dn: Dn::new(dn),
        attributes: vec![],
    }
}
