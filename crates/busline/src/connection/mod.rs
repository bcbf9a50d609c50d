//! Connection engine
//!
//! A [`Connection`] owns one transport (or, in server mode, one listener)
//! and everything routed through it:
//!
//! ```text
//!              ┌──────────────────────── Connection ─────────────────────────┐
//!   handles ──▶│ link: Mutex         mode, transport, listener, base service │
//!              │ state: RwLock       object tree, signal hooks, service names│
//!              │ watches: Reentrant  transport watches and timeouts          │
//!              │ peer_pending        calls to fail on close (peer mode)      │
//!              └───────────────┬─────────────────────────────────────────────┘
//!                              │ post(task)
//!                              ▼
//!                       home LoopHandle ── dispatch, timeouts, deliveries
//! ```
//!
//! The transport handle is only ever cloned out of `link`; transport calls
//! made while `state` is held never need `state` again. No lock is held
//! while user code runs.

mod calls;
mod dispatch;
mod filters;
mod signals;
mod watch;


use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use busline_wire::{
    BusError, Capabilities, ErrorType, Listener, Message, MessageFlags, MessageType, Transport,
    Value, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::context::IncomingCall;
use crate::event_loop::LoopHandle;
use crate::export::{ObjectId, ObjectListener, ObjectRef, RegisterOptions, VirtualObjectMode};
use crate::handle::{ConnectionHandle, NewConnectionHandler};
use crate::object_tree::{ObjectTree, UnregisterMode};
use crate::pending::PendingCall;
use crate::registry::RegistryInner;
use crate::signal_hooks::{BusRules, HookTarget, InternalSlot, SignalHook, SignalHookTable};

pub use calls::CallMode;
pub use signals::SignalMatch;
use watch::{ConnectionEvents, WatchTable};

/// How a connection talks to the outside world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    /// Connected to a message bus
    Client,
    /// Listening for peer connections
    Server,
    /// Connected directly to one peer
    Peer,
    /// Not connected
    Invalid,
}

struct Link {
    mode: ConnectionMode,
    transport: Option<Arc<dyn Transport>>,
    listener: Option<Arc<dyn Listener>>,
    capabilities: Capabilities,
    base_service: String,
}

/// Routing state guarded by the connection's read/write lock
struct DispatchState {
    tree: ObjectTree,
    hooks: SignalHookTable,
    /// Well-known names owned through this connection
    service_names: Vec<String>,
}

pub(crate) struct Connection {
    name: String,
    /// Mode requested when the connection was opened
    opened_as: ConnectionMode,
    home: LoopHandle,
    config: ConnectionConfig,
    registry: Weak<RegistryInner>,
    self_ref: Weak<Connection>,
    link: Mutex<Link>,
    last_error: Mutex<Option<BusError>>,
    state: RwLock<DispatchState>,
    watches: ReentrantMutex<RefCell<WatchTable>>,
    dispatch_posted: AtomicBool,
    peer_pending: Mutex<Vec<PendingCall>>,
    new_connection_handler: Mutex<Option<NewConnectionHandler>>,
    /// Registry names of peers accepted by this server
    server_peers: Mutex<Vec<String>>,
    /// The server that accepted this peer
    accepted_by: Mutex<Option<Weak<Connection>>>,
}

/// Match-rule and name-owner operations of a bus connection
pub(crate) struct TransportRules {
    transport: Arc<dyn Transport>,
    timeout: std::time::Duration,
}

impl BusRules for TransportRules {
    fn add_match(&self, rule: &str) {
        // the hook stays installed locally either way
        if let Err(err) = self.transport.add_match(rule) {
            warn!("failed to add match rule {}: {}", rule, err);
        }
    }

    fn remove_match(&self, rule: &str) {
        if let Err(err) = self.transport.remove_match(rule) {
            debug!("failed to remove match rule {}: {}", rule, err);
        }
    }

    fn name_owner(&self, name: &str) -> String {
        let query = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "GetNameOwner")
            .with_arg(name);
        match self.transport.send_with_reply_and_block(query, self.timeout) {
            Ok(reply) if reply.kind() == MessageType::MethodReturn => reply
                .args()
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Ok(_) | Err(_) => String::new(),
        }
    }
}

impl Connection {
    pub(crate) fn new(
        name: String,
        opened_as: ConnectionMode,
        home: LoopHandle,
        config: ConnectionConfig,
        registry: Weak<RegistryInner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Connection {
            name,
            opened_as,
            home,
            config,
            registry,
            self_ref: self_ref.clone(),
            link: Mutex::new(Link {
                mode: ConnectionMode::Invalid,
                transport: None,
                listener: None,
                capabilities: Capabilities::empty(),
                base_service: String::new(),
            }),
            last_error: Mutex::new(None),
            state: RwLock::new(DispatchState {
                tree: ObjectTree::new(),
                hooks: SignalHookTable::new(),
                service_names: Vec::new(),
            }),
            watches: ReentrantMutex::new(RefCell::new(WatchTable::default())),
            dispatch_posted: AtomicBool::new(false),
            peer_pending: Mutex::new(Vec::new()),
            new_connection_handler: Mutex::new(None),
            server_peers: Mutex::new(Vec::new()),
            accepted_by: Mutex::new(None),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn opened_as(&self) -> ConnectionMode {
        self.opened_as
    }

    pub(crate) fn mode(&self) -> ConnectionMode {
        self.link.lock().mode
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.link.lock().transport.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        let link = self.link.lock();
        match link.mode {
            ConnectionMode::Invalid => false,
            ConnectionMode::Server => link.listener.as_ref().map_or(false, |l| l.is_listening()),
            ConnectionMode::Client | ConnectionMode::Peer => {
                link.transport.as_ref().map_or(false, |t| t.is_connected())
            }
        }
    }

    pub(crate) fn base_service(&self) -> String {
        self.link.lock().base_service.clone()
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        self.link.lock().capabilities
    }

    pub(crate) fn machine_id(&self) -> String {
        self.transport().map(|t| t.machine_id()).unwrap_or_default()
    }

    pub(crate) fn listener_address(&self) -> Option<String> {
        self.link.lock().listener.as_ref().map(|l| l.address())
    }

    pub(crate) fn last_error(&self) -> Option<BusError> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<BusError>) {
        *self.last_error.lock() = error;
    }

    fn listener_ref(&self) -> Weak<dyn ObjectListener> {
        let listener: Weak<dyn ObjectListener> = self.self_ref.clone();
        listener
    }

    /// Rule operations, present only on bus connections
    fn bus_rules(&self) -> Option<TransportRules> {
        let link = self.link.lock();
        if link.mode != ConnectionMode::Client {
            return None;
        }
        link.transport.clone().map(|transport| TransportRules {
            transport,
            timeout: self.config.default_timeout,
        })
    }

    fn fail_establish(&self, error: BusError) {
        debug!("connection '{}' failed: {}", self.name, error);
        self.link.lock().mode = ConnectionMode::Invalid;
        self.set_last_error(Some(error));
    }

    /// Adopt a bus transport
    pub(crate) fn set_connection(self: &Arc<Self>, result: Result<Arc<dyn Transport>, BusError>) {
        let transport = match result {
            Ok(transport) => transport,
            Err(error) => return self.fail_establish(error),
        };
        let base_service = transport.unique_name();
        {
            let mut link = self.link.lock();
            link.mode = ConnectionMode::Client;
            link.capabilities = transport.capabilities();
            link.base_service = base_service.clone();
            link.transport = Some(transport.clone());
        }
        transport.set_events(Arc::new(ConnectionEvents::new(self)));

        {
            let mut state = self.state.write();
            for (member, slot) in [
                ("NameAcquired", InternalSlot::RegisterService),
                ("NameLost", InternalSlot::UnregisterService),
            ] {
                let hook = SignalHook::new(
                    DBUS_SERVICE,
                    "",
                    DBUS_INTERFACE,
                    member,
                    Vec::new(),
                    None,
                    HookTarget::Internal(slot),
                );
                state
                    .hooks
                    .insert_unmanaged(SignalHookTable::key(member, DBUS_INTERFACE), hook);
            }
        }
        debug!("connection '{}' established as {}", self.name, base_service);
        self.schedule_dispatch();
    }

    /// Adopt a peer-to-peer transport
    pub(crate) fn set_peer(self: &Arc<Self>, result: Result<Arc<dyn Transport>, BusError>) {
        let transport = match result {
            Ok(transport) => transport,
            Err(error) => return self.fail_establish(error),
        };
        {
            let mut link = self.link.lock();
            link.mode = ConnectionMode::Peer;
            link.capabilities = transport.capabilities();
            link.base_service.clear();
            link.transport = Some(transport.clone());
        }
        transport.set_events(Arc::new(ConnectionEvents::new(self)));
        debug!("peer connection '{}' established", self.name);
        self.schedule_dispatch();
    }

    /// Adopt a listener accepting peer connections
    pub(crate) fn set_server(self: &Arc<Self>, result: Result<Arc<dyn Listener>, BusError>) {
        let listener = match result {
            Ok(listener) => listener,
            Err(error) => return self.fail_establish(error),
        };
        let weak = self.self_ref.clone();
        listener.set_new_connection_handler(Box::new(move |transport| {
            match weak.upgrade() {
                Some(server) => server.accept_peer(transport),
                None => transport.close(),
            }
        }));
        debug!("server '{}' listening on {}", self.name, listener.address());
        let mut link = self.link.lock();
        link.mode = ConnectionMode::Server;
        link.listener = Some(listener);
    }

    pub(crate) fn set_new_connection_handler(&self, handler: NewConnectionHandler) {
        *self.new_connection_handler.lock() = Some(handler);
    }

    /// Wrap an accepted transport into a peer connection homed with the
    /// server
    fn accept_peer(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let Some(registry) = self.registry.upgrade() else {
            transport.close();
            return;
        };
        let name = registry.next_server_peer_name();
        let peer = Connection::new(
            name.clone(),
            ConnectionMode::Peer,
            self.home.clone(),
            self.config.clone(),
            self.registry.clone(),
        );
        *peer.accepted_by.lock() = Some(Arc::downgrade(self));
        peer.set_peer(Ok(transport));
        registry.insert(&name, peer.clone());
        self.server_peers.lock().push(name.clone());

        let handler = self.new_connection_handler.lock().clone();
        match handler {
            Some(handler) => {
                let handle = ConnectionHandle::from_inner(peer);
                self.home.post(Box::new(move || handler(handle)));
            }
            None => debug!("server '{}' has no handler for '{}'", self.name, name),
        }
    }

    /// Drop the transport or listener and fail what still waits on it
    pub(crate) fn close_connection(&self) {
        let (transport, listener) = {
            let mut link = self.link.lock();
            link.mode = ConnectionMode::Invalid;
            link.base_service.clear();
            (link.transport.take(), link.listener.take())
        };
        if transport.is_none() && listener.is_none() {
            return;
        }
        debug!("closing connection '{}'", self.name);
        if let Some(listener) = listener {
            listener.close();
        }
        if let Some(transport) = transport {
            transport.close();
        }
        self.clear_watches();

        let pending = std::mem::take(&mut *self.peer_pending.lock());
        for call in pending {
            call.finish(None);
        }

        let peers = std::mem::take(&mut *self.server_peers.lock());
        if let Some(registry) = self.registry.upgrade() {
            for name in peers {
                registry.remove(&name);
            }
        }
    }

    /// Unlist an accepted peer whose remote side went away
    pub(super) fn release_accepted(&self) {
        let Some(server) = self.accepted_by.lock().take() else {
            return;
        };
        if let Some(server) = server.upgrade() {
            server.server_peers.lock().retain(|name| name != &self.name);
        }
        if let Some(registry) = self.registry.upgrade() {
            debug!("accepted peer '{}' left", self.name);
            registry.remove(&self.name);
        }
    }

    pub(crate) fn forget_pending(&self, call: &PendingCall) {
        self.peer_pending.lock().retain(|p| !p.ptr_eq(call));
    }

    /// Send without tracking a reply. Returns the serial, 0 on failure.
    pub(crate) fn send(&self, msg: Message) -> u32 {
        let Some(transport) = self.transport() else {
            debug!("'{}' not connected, dropping {}", self.name, msg.member());
            return 0;
        };
        if let Err(err) = msg.validate() {
            warn!(
                "cannot send message to '{}' path '{}' member '{}': {}",
                msg.destination(),
                msg.path(),
                msg.member(),
                err
            );
            return 0;
        }
        match transport.send(msg) {
            Ok(serial) => serial,
            Err(err) => {
                warn!("send failed on '{}': {}", self.name, err);
                self.set_last_error(Some(err.into()));
                0
            }
        }
    }

    /// Deliver the answer to `call`: kept for the caller on the local loop,
    /// sent otherwise
    pub(crate) fn send_reply_to(&self, call: &IncomingCall, reply: Message) -> bool {
        if call.is_local() {
            return call.store_local_reply(reply);
        }
        if !call.message().is_reply_required() {
            return false;
        }
        self.send(reply) != 0
    }

    fn send_error(&self, call: &IncomingCall, kind: ErrorType, text: String) {
        let reply = call.message().create_error_reply_of(kind, text);
        self.send_reply_to(call, reply);
    }

    pub(crate) fn register_object(&self, path: &str, object: &ObjectRef, options: RegisterOptions) -> bool {
        let flags = options - (RegisterOptions::VIRTUAL_OBJECT | RegisterOptions::SUB_PATH);
        if flags.is_empty() || object.is_virtual() || !self.is_connected() {
            return false;
        }
        self.bind_object(path, object, flags)
    }

    pub(crate) fn register_virtual_object(
        &self,
        path: &str,
        object: &ObjectRef,
        mode: VirtualObjectMode,
    ) -> bool {
        if !object.is_virtual() || !self.is_connected() {
            return false;
        }
        let mut flags = RegisterOptions::VIRTUAL_OBJECT;
        if mode == VirtualObjectMode::SubPath {
            flags |= RegisterOptions::SUB_PATH;
        }
        self.bind_object(path, object, flags)
    }

    fn bind_object(&self, path: &str, object: &ObjectRef, flags: RegisterOptions) -> bool {
        let registered = self.state.write().tree.register(path, object.clone(), flags);
        if registered {
            object.add_listener(self.listener_ref());
            debug!("'{}' registered {} at {} ({:?})", self.name, object.id(), path, flags);
        }
        registered
    }

    pub(crate) fn unregister_object(&self, path: &str, mode: UnregisterMode) {
        if !self.is_connected() {
            return;
        }
        self.state.write().tree.unregister(path, mode);
    }

    pub(crate) fn object_registered_at(&self, path: &str) -> Option<ObjectRef> {
        if !self.is_connected() {
            return None;
        }
        self.state.read().tree.object_registered_at(path)
    }

    pub(crate) fn record_service(&self, name: &str) {
        let mut state = self.state.write();
        if !state.service_names.iter().any(|s| s == name) {
            state.service_names.push(name.to_string());
        }
    }

    pub(crate) fn forget_service(&self, name: &str) {
        self.state.write().service_names.retain(|s| s != name);
    }

    pub(crate) fn service_names(&self) -> Vec<String> {
        self.state.read().service_names.clone()
    }

    /// True if `service` names this connection
    pub(crate) fn is_own_service(&self, service: &str) -> bool {
        if service.is_empty() {
            return false;
        }
        if service == self.base_service() {
            return true;
        }
        if service == DBUS_SERVICE {
            return false;
        }
        self.state.read().service_names.iter().any(|s| s == service)
    }

    pub(crate) fn registry(&self) -> Option<Arc<RegistryInner>> {
        self.registry.upgrade()
    }
}

impl ObjectListener for Connection {
    fn object_destroyed(&self, id: ObjectId) {
        let rules = self.bus_rules();
        let mut state = self.state.write();
        state.tree.destroy_handler(id);
        state
            .hooks
            .remove_target(id, rules.as_ref().map(|r| r as &dyn BusRules));
    }

    fn relay_signal(
        &self,
        object: &ObjectRef,
        category: RegisterOptions,
        interface: &str,
        member: &str,
        args: &[Value],
    ) {
        if !self.is_connected() {
            return;
        }
        let paths = self.state.read().tree.emit_paths(object.id(), category);
        for path in paths {
            debug!("'{}' relaying {}.{} from {}", self.name, interface, member, path);
            let signal = Message::signal(path, interface, member)
                .with_args(args.to_vec())
                .with_flags(MessageFlags::NO_REPLY_EXPECTED);
            self.send(signal);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_connection();
    }
}
