//! Named connections
//!
//! A [`ConnectionRegistry`] is the process-scoped table of connections by
//! name. Opening a name twice returns the same connection; an empty name
//! always opens a fresh, unlisted one.
//!
//! The registry must outlive the handles it issues: connections only keep
//! a weak reference back to it. When the last registry clone is dropped,
//! connections nobody else holds are destroyed and the rest have their
//! transports closed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use busline_wire::{BusKind, Connector, Message};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionMode};
use crate::context::current_sender;
use crate::event_loop::LoopHandle;
use crate::handle::ConnectionHandle;

/// How to establish a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Establish {
    /// One of the well-known buses
    Bus(BusKind),
    /// The bus at an address
    Address(String),
    /// A peer at an address
    Peer(String),
    /// Listen for peers at an address
    Listen(String),
}

impl Establish {
    fn mode(&self) -> ConnectionMode {
        match self {
            Establish::Bus(_) | Establish::Address(_) => ConnectionMode::Client,
            Establish::Peer(_) => ConnectionMode::Peer,
            Establish::Listen(_) => ConnectionMode::Server,
        }
    }
}

type SpyHook = Arc<dyn Fn(&Message) + Send + Sync>;

pub(crate) struct RegistryInner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    spy_hooks: RwLock<Vec<SpyHook>>,
    next_server_peer: AtomicU64,
}

impl RegistryInner {
    pub(crate) fn run_spy_hooks(&self, msg: &Message) {
        let hooks = self.spy_hooks.read().clone();
        for hook in hooks {
            hook(msg);
        }
    }

    pub(crate) fn insert(&self, name: &str, connection: Arc<Connection>) {
        self.connections.lock().insert(name.to_string(), connection);
    }

    pub(crate) fn remove(&self, name: &str) {
        let removed = self.connections.lock().remove(name);
        drop(removed);
    }

    pub(crate) fn next_server_peer_name(&self) -> String {
        format!("server-{}", self.next_server_peer.fetch_add(1, Ordering::Relaxed))
    }

    /// Destroy unreferenced connections, close the others
    fn tear_down(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            if Arc::strong_count(&connection) > 1 {
                debug!("connection '{}' still referenced, closing it", connection.name());
                connection.close_connection();
            }
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.tear_down();
    }
}

/// Table of named connections sharing one connector and configuration
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connector,
                config,
                connections: Mutex::new(HashMap::new()),
                spy_hooks: RwLock::new(Vec::new()),
                next_server_peer: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Connection named `name`, established with `establish` unless it is
    /// already open. Failures still yield a handle; check
    /// [`ConnectionHandle::is_connected`].
    pub fn open(&self, name: &str, establish: Establish) -> ConnectionHandle {
        if !name.is_empty() {
            if let Some(existing) = self.inner.connections.lock().get(name) {
                return ConnectionHandle::from_inner(existing.clone());
            }
        }

        let connection = Connection::new(
            name.to_string(),
            establish.mode(),
            LoopHandle::current(),
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
        );
        let connector = &self.inner.connector;
        match &establish {
            Establish::Bus(kind) => connection.set_connection(connector.connect_bus(*kind)),
            Establish::Address(address) => connection.set_connection(connector.connect_bus_address(address)),
            Establish::Peer(address) => connection.set_peer(connector.connect_peer(address)),
            Establish::Listen(address) => connection.set_server(connector.listen(address)),
        }
        if name.is_empty() {
            return ConnectionHandle::from_inner(connection);
        }

        let mut connections = self.inner.connections.lock();
        match connections.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                // another thread opened the same name meanwhile
                let existing = entry.get().clone();
                drop(connections);
                connection.close_connection();
                ConnectionHandle::from_inner(existing)
            }
            Entry::Vacant(entry) => {
                entry.insert(connection.clone());
                ConnectionHandle::from_inner(connection)
            }
        }
    }

    pub fn connect_to_bus(&self, kind: BusKind, name: &str) -> ConnectionHandle {
        self.open(name, Establish::Bus(kind))
    }

    pub fn connect_to_bus_address(&self, address: &str, name: &str) -> ConnectionHandle {
        self.open(name, Establish::Address(address.to_string()))
    }

    pub fn connect_to_peer(&self, address: &str, name: &str) -> ConnectionHandle {
        self.open(name, Establish::Peer(address.to_string()))
    }

    /// Server-mode connection accepting peers at `address`
    pub fn listen(&self, address: &str, name: &str) -> ConnectionHandle {
        self.open(name, Establish::Listen(address.to_string()))
    }

    /// Open connection named `name`
    pub fn get(&self, name: &str) -> Option<ConnectionHandle> {
        self.inner
            .connections
            .lock()
            .get(name)
            .cloned()
            .map(ConnectionHandle::from_inner)
    }

    /// Drop the registry's reference to `name` if it was opened as
    /// `expected`. The connection closes once no handle refers to it.
    pub fn close(&self, name: &str, expected: ConnectionMode) -> bool {
        let removed = {
            let mut connections = self.inner.connections.lock();
            match connections.get(name) {
                Some(connection) if connection.opened_as() == expected => connections.remove(name),
                Some(connection) => {
                    debug!(
                        "not closing '{}': opened as {:?}, not {:?}",
                        name,
                        connection.opened_as(),
                        expected
                    );
                    None
                }
                None => None,
            }
        };
        removed.is_some()
    }

    pub fn disconnect_from_bus(&self, name: &str) -> bool {
        self.close(name, ConnectionMode::Client)
    }

    pub fn disconnect_from_peer(&self, name: &str) -> bool {
        self.close(name, ConnectionMode::Peer)
    }

    /// Tear every connection down now
    pub fn shutdown(&self) {
        self.inner.tear_down();
    }

    /// Observe every incoming message on every connection, before dispatch
    pub fn add_spy_hook<F>(&self, hook: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.spy_hooks.write().push(Arc::new(hook));
    }

    /// Connection delivering the call or signal currently running on this
    /// thread
    pub fn sender() -> Option<ConnectionHandle> {
        current_sender().map(ConnectionHandle::from_inner)
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.inner.connections.lock().keys().cloned().collect();
        f.debug_struct("ConnectionRegistry").field("connections", &names).finish()
    }
}
