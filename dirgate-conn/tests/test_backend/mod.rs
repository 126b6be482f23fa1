use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dirgate_conn::{
    AccessLogger, Backend, BackendError, BackendResult, BindCredentials, BindRequest, ClientConnection,
    ConnectionConfig, ConnectionInfo, ConnectionRegistry, DeleteRequest, DisconnectRecord, Dn, ModifyRequest,
    Operation, OperationDispatcher, OperationResult, Request, RequestRecord, ResultCode, SearchEntry, SearchRequest,
    SearchScope, SearchSink, TaskPool, WorkerPoolConfig, async_trait,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// Initialize tracing for the test binary.  Idempotent.
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

/// A backend whose behavior is scripted by the request parameters:
///
/// - `delete`: succeeds, unless the DN is `cn=missing` (fails with `NoSuchObject`) or `cn=panic`
///   (panics)
/// - `modify`: blocks until the test releases it with [`TestBackend::release_modifies`], or the
///   operation is cancelled
/// - `bind`: simple bind succeeds with password `secret`, otherwise returns `InvalidCredentials`.
///   With password `gated` it waits for [`TestBackend::release_binds`], ignoring cancellation, and
///   then succeeds.
/// - `search`: sends `size_limit` entries, or, if `size_limit` is zero, keeps sending entries
///   until told to stop
pub struct TestBackend {
    modify_gate: Semaphore,
    bind_gate: Semaphore,
}

impl Default for TestBackend {
    fn default() -> Self {
        Self {
            modify_gate: Semaphore::new(0),
            bind_gate: Semaphore::new(0),
        }
    }
}

impl TestBackend {
    pub fn release_modifies(&self, count: usize) {
        self.modify_gate.add_permits(count);
    }

    pub fn release_binds(&self, count: usize) {
        self.bind_gate.add_permits(count);
    }
}

#[async_trait]
impl Backend for TestBackend {
    async fn delete(&self, _operation: &Operation, request: &DeleteRequest) -> BackendResult {
        match request.dn.0.as_str() {
            "cn=missing" => Err(BackendError::new(ResultCode::NoSuchObject, "no such entry")),
            "cn=panic" => panic!("backend exploded"),
            _ => Ok(OperationResult::success()),
        }
    }

    async fn modify(&self, operation: &Operation, _request: &ModifyRequest) -> BackendResult {
        // Check cancellation first so a cancelled modify never consumes a release meant for
        // another one
        tokio::select! {
            biased;
            _ = operation.cancellation_token().cancelled() => {
                Err(BackendError::new(ResultCode::Cancelled, "cancelled while waiting"))
            }
            permit = self.modify_gate.acquire() => {
                permit.map_err(|_| BackendError::new(ResultCode::Unavailable, "gate closed"))?.forget();
                Ok(OperationResult::success())
            }
        }
    }

    async fn bind(&self, _operation: &Operation, request: &BindRequest) -> BackendResult {
        match &request.credentials {
            BindCredentials::Simple { password } if password == "secret" => Ok(OperationResult::success()),
            BindCredentials::Simple { password } if password == "gated" => {
                self.bind_gate
                    .acquire()
                    .await
                    .map_err(|_| BackendError::new(ResultCode::Unavailable, "gate closed"))?
                    .forget();
                Ok(OperationResult::success())
            }
            _ => Ok(OperationResult::new(ResultCode::InvalidCredentials)),
        }
    }

    async fn search(&self, operation: &Operation, request: &SearchRequest, sink: &SearchSink<'_>) -> BackendResult {
        let mut sent = 0u32;
        loop {
            if request.size_limit != 0 && sent >= request.size_limit {
                break;
            }
            let entry = SearchEntry {
                dn: Dn::new(format!("cn=entry{sent},{}", request.base)),
                attributes: vec![],
            };
            if !sink.send_entry(entry) {
                break;
            }
            sent += 1;
            if operation.is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        Ok(OperationResult::success())
    }
}

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

/// Everything needed to drive one connection end to end
pub struct TestHarness {
    pub registry: Arc<ConnectionRegistry>,
    pub backend: Arc<TestBackend>,
    pub pool: Arc<TaskPool>,
    pub connection: Arc<ClientConnection>,
    pub dispatcher: OperationDispatcher,
    pub log: Arc<RecordingAccessLog>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default(), WorkerPoolConfig::default())
    }

    pub fn with_config(config: ConnectionConfig, pool_config: WorkerPoolConfig) -> Self {
        init_test_logging();

        let registry = ConnectionRegistry::new();
        let backend = Arc::new(TestBackend::default());
        let pool = Arc::new(TaskPool::new(
            backend.clone(),
            pool_config,
            tokio::runtime::Handle::current(),
        ));
        let log = Arc::new(RecordingAccessLog::default());
        let connection = registry
            .accept(connection_info(), config, log.clone())
            .unwrap();
        let dispatcher = OperationDispatcher::new(connection.clone(), pool.clone());

        Self {
            registry,
            backend,
            pool,
            connection,
            dispatcher,
            log,
        }
    }
}

pub fn connection_info() -> ConnectionInfo {
    ConnectionInfo {
        client_address: "198.51.100.7:51000".parse().unwrap(),
        server_address: "198.51.100.1:8080".parse().unwrap(),
        protocol: "HTTP".to_string(),
    }
}

pub fn delete(dn: &str) -> Request {
    Request::Delete(DeleteRequest { dn: Dn::new(dn) })
}

pub fn blocking_modify() -> Request {
    Request::Modify(ModifyRequest {
        dn: Dn::new("cn=slow"),
        changes: vec![],
    })
}

pub fn simple_bind(dn: &str, password: &str) -> Request {
    Request::Bind(BindRequest {
        dn: Dn::new(dn),
        credentials: BindCredentials::Simple {
            password: password.to_string(),
        },
    })
}

pub fn search(size_limit: u32) -> Request {
    Request::Search(SearchRequest {
        base: Dn::new("dc=example,dc=com"),
        scope: SearchScope::WholeSubtree,
        filter: "(objectClass=*)".to_string(),
        attributes: vec![],
        size_limit,
    })
}

/// Await a future, failing the test if it takes unreasonably long
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Poll `condition` until it holds, failing the test if it takes unreasonably long
pub async fn wait_until(condition: impl Fn() -> bool) {
    within_timeout(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}
