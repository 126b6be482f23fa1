//! Tracks every open connection, decides which client addresses may connect at all, and
//! provides the server-wide operations: shutting everything down and reaping idle connections.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::Result;
use crate::access_log::AccessLogger;
use crate::config::ConnectionConfig;
use crate::connection::{ClientConnection, ConnectionInfo, DisconnectReason};
use crate::types::ConnectionId;

/// Decides whether a client may connect
pub trait AddressFilter: Send + Sync + 'static {
    fn is_allowed(&self, address: &IpAddr) -> bool;
}

/// Explicit allow and deny lists of client addresses.
///
/// An address on the deny list is always refused.  If the allow list is empty every other
/// address is allowed, otherwise only the addresses on it are.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AllowDenyList {
    pub allowed: Vec<IpAddr>,
    pub denied: Vec<IpAddr>,
}

impl AddressFilter for AllowDenyList {
    fn is_allowed(&self, address: &IpAddr) -> bool {
        if self.denied.contains(address) {
            return false;
        }
        self.allowed.is_empty() || self.allowed.contains(address)
    }
}

pub struct ConnectionRegistry {
    filter: Box<dyn AddressFilter>,
    next_id: AtomicU64,
    /// Held weakly; whoever owns the transport owns the connection
    connections: Mutex<HashMap<ConnectionId, Weak<ClientConnection>>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// A registry that accepts connections from any address
    pub fn new() -> Arc<Self> {
        Self::with_filter(AllowDenyList::default())
    }

    pub fn with_filter(filter: impl AddressFilter) -> Arc<Self> {
        Arc::new(Self {
            filter: Box::new(filter),
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Accept a new client connection.  See [`ClientConnection::open`].
    pub fn accept(
        self: &Arc<Self>,
        info: ConnectionInfo,
        config: ConnectionConfig,
        access_log: Arc<dyn AccessLogger>,
    ) -> Result<Arc<ClientConnection>> {
        ClientConnection::open(self.clone(), info, config, access_log)
    }

    pub fn is_allowed(&self, address: &IpAddr) -> bool {
        self.filter.is_allowed(address)
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, connection: &Arc<ClientConnection>) {
        let previous = self
            .connections
            .lock()
            .insert(connection.id(), Arc::downgrade(connection));

        if previous.is_some() {
            tracing::error!(connection_id = %connection.id(),
                "BUG: Connection ID registered twice");
        }
    }

    pub(crate) fn unregister(&self, id: ConnectionId) {
        self.connections.lock().remove(&id);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Number of registered connections.  Connections that were dropped without disconnecting
    /// are still counted until the next [`Self::connections`] call prunes them.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live connection, ordered by ID
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|_, weak| weak.strong_count() > 0);

        let mut live: Vec<_> = connections.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|connection| connection.id());
        live
    }

    pub fn find_by_client_address(&self, address: &SocketAddr) -> Vec<Arc<ClientConnection>> {
        self.connections()
            .into_iter()
            .filter(|connection| &connection.info().client_address == address)
            .collect()
    }

    /// Disconnect every registered connection
    pub fn shutdown_all(&self, reason: DisconnectReason) -> usize {
        // Disconnecting unregisters, so don't hold the lock while doing it
        let connections = self.connections();
        tracing::info!(num_connections = connections.len(),
            %reason,
            "Disconnecting all connections");

        for connection in &connections {
            connection.disconnect(reason, None);
        }
        connections.len()
    }

    /// Disconnect every connection that has been idle for longer than its configured
    /// `idle_time_limit`.  Returns how many were disconnected.
    pub fn disconnect_idle(&self) -> usize {
        let idle: Vec<_> = self
            .connections()
            .into_iter()
            .filter(|connection| match connection.config().idle_time_limit {
                Some(limit) => connection.idle_time() > limit,
                None => false,
            })
            .collect();

        for connection in &idle {
            tracing::debug!(connection_id = %connection.id(),
                idle_time = ?connection.idle_time(),
                "Disconnecting idle connection");
            connection.disconnect(DisconnectReason::IdleTimeLimitExceeded, None);
        }
        idle.len()
    }
}
