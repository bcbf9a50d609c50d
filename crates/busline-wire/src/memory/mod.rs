//! In-process bus
//!
//! [`MemoryBus`] is a message bus living inside the process: it assigns
//! unique names, owns well-known names, answers the `org.freedesktop.DBus`
//! driver methods, and routes signals by match rule. [`MemoryConnector`]
//! bundles a session bus, a system bus, extra buses by address and peer
//! listeners behind the [`Connector`] contract.
//!
//! Routing is synchronous on the sending thread; receivers are told about
//! new data through their [`TransportEvents`](crate::transport::TransportEvents).

mod driver;
mod endpoint;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{BusError, ErrorType, Result, WireError};
use crate::message::{Message, MessageType};
use crate::transport::{BusKind, Connector, Listener, Transport};

pub use driver::{DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE};
pub use endpoint::MemoryTransport;
use endpoint::Link;

/// Owner record of a well-known name
#[derive(Debug, Clone)]
struct NameOwner {
    owner: String,
    allow_replacement: bool,
}

struct BusState {
    endpoints: HashMap<String, Weak<MemoryTransport>>,
    names: BTreeMap<String, NameOwner>,
    next_id: u64,
    next_serial: u32,
}

/// Shared state of one in-process bus
pub(crate) struct BusCore {
    id: String,
    address: String,
    state: Mutex<BusState>,
}

impl BusCore {
    fn owner_of(state: &BusState, name: &str) -> Option<String> {
        if name == DBUS_SERVICE {
            return Some(DBUS_SERVICE.to_string());
        }
        if name.starts_with(':') {
            return state.endpoints.contains_key(name).then(|| name.to_string());
        }
        state.names.get(name).map(|n| n.owner.clone())
    }

    fn endpoint(state: &BusState, unique: &str) -> Option<Arc<MemoryTransport>> {
        state.endpoints.get(unique).and_then(Weak::upgrade)
    }

    fn driver_serial(state: &mut BusState) -> u32 {
        let serial = state.next_serial;
        state.next_serial = state.next_serial.wrapping_add(1).max(1);
        serial
    }

    /// Route a message sent by `from`
    pub(crate) fn route(&self, from: &MemoryTransport, msg: Message) -> Result<()> {
        if msg.destination() == DBUS_SERVICE {
            driver::handle(self, from, msg);
            return Ok(());
        }

        match msg.kind() {
            MessageType::Signal => {
                self.broadcast(msg);
                Ok(())
            }
            MessageType::Invalid => Err(WireError::InvalidMessage("invalid message type".into())),
            _ => {
                let target = {
                    let state = self.state.lock();
                    Self::owner_of(&state, msg.destination())
                        .and_then(|unique| Self::endpoint(&state, &unique))
                };
                match target {
                    Some(endpoint) => endpoint.deliver(msg),
                    None if msg.is_reply_required() => {
                        let mut error = msg.create_error_reply_of(
                            ErrorType::ServiceUnknown,
                            format!(
                                "The name {} was not provided by any .service files",
                                msg.destination()
                            ),
                        );
                        error.set_sender(DBUS_SERVICE);
                        from.deliver(error);
                    }
                    None => debug!("dropping message to unknown name {}", msg.destination()),
                }
                Ok(())
            }
        }
    }

    /// Deliver a signal to its destination, or to every endpoint whose
    /// rules match
    pub(crate) fn broadcast(&self, msg: Message) {
        let targets: Vec<Arc<MemoryTransport>> = {
            let state = self.state.lock();
            if !msg.destination().is_empty() {
                Self::owner_of(&state, msg.destination())
                    .and_then(|unique| Self::endpoint(&state, &unique))
                    .into_iter()
                    .collect()
            } else {
                state
                    .endpoints
                    .values()
                    .filter_map(Weak::upgrade)
                    .filter(|ep| ep.wants(&msg, |name| Self::owner_of(&state, name)))
                    .collect()
            }
        };
        for target in targets {
            target.deliver(msg.clone());
        }
    }

    /// Forget a departed endpoint and release its names
    pub(crate) fn disconnect(&self, unique: &str) {
        let signals = {
            let mut state = self.state.lock();
            if state.endpoints.remove(unique).is_none() {
                return;
            }
            let released: Vec<String> = state
                .names
                .iter()
                .filter(|(_, n)| n.owner == unique)
                .map(|(name, _)| name.clone())
                .collect();
            let mut signals = Vec::new();
            for name in released {
                state.names.remove(&name);
                signals.push(driver::name_owner_changed(&mut state, &name, unique, ""));
            }
            signals.push(driver::name_owner_changed(&mut state, unique, unique, ""));
            signals
        };
        debug!("{} left the bus", unique);
        for signal in signals {
            self.broadcast(signal);
        }
    }
}

/// An in-process message bus
#[derive(Clone)]
pub struct MemoryBus {
    core: Arc<BusCore>,
}

impl MemoryBus {
    /// Create a bus reachable at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            core: Arc::new(BusCore {
                id: generate_id(),
                address: address.into(),
                state: Mutex::new(BusState {
                    endpoints: HashMap::new(),
                    names: BTreeMap::new(),
                    next_id: 1,
                    next_serial: 1,
                }),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.core.address
    }

    /// Bus identifier, also used as the machine id
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Attach a new connection
    pub fn connect(&self) -> Arc<MemoryTransport> {
        let (transport, signal) = {
            let mut state = self.core.state.lock();
            let unique = format!(":1.{}", state.next_id);
            state.next_id += 1;
            let transport = Arc::new(MemoryTransport::new(
                Link::Bus(self.core.clone()),
                unique.clone(),
                self.core.id.clone(),
            ));
            state
                .endpoints
                .insert(unique.clone(), Arc::downgrade(&transport));
            let signal = driver::name_owner_changed(&mut state, &unique, "", &unique);
            (transport, signal)
        };
        debug!("{} joined bus {}", transport.unique_name(), self.core.address);
        self.core.broadcast(signal);
        transport
    }

    /// Names currently known to the bus
    pub fn names(&self) -> Vec<String> {
        driver::list_names(&self.core.state.lock())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new("memory:bus=default")
    }
}

/// Accepts peer connections at an address
pub struct MemoryListener {
    address: String,
    machine_id: String,
    listening: AtomicBool,
    handler: Mutex<Option<Arc<dyn Fn(Arc<dyn Transport>) + Send + Sync>>>,
}

impl MemoryListener {
    /// Create a linked pair and hand the server half to the handler
    fn accept(&self) -> std::result::Result<Arc<dyn Transport>, BusError> {
        if !self.listening.load(Ordering::SeqCst) {
            return Err(WireError::NoServer(self.address.clone()).into());
        }
        let (client, server) = MemoryTransport::peer_pair(&self.machine_id);
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(server),
            None => debug!("no connection handler on {}, dropping peer", self.address),
        }
        Ok(client)
    }
}

impl Listener for MemoryListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn set_new_connection_handler(&self, handler: Box<dyn Fn(Arc<dyn Transport>) + Send + Sync>) {
        *self.handler.lock() = Some(Arc::from(handler));
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.handler.lock().take();
    }
}

/// [`Connector`] over in-process buses and listeners
pub struct MemoryConnector {
    session: MemoryBus,
    system: MemoryBus,
    buses: Mutex<HashMap<String, MemoryBus>>,
    listeners: Mutex<HashMap<String, Weak<MemoryListener>>>,
    next_listener: AtomicU64,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let session = MemoryBus::new("memory:bus=session");
        let system = MemoryBus::new("memory:bus=system");
        let mut buses = HashMap::new();
        buses.insert(session.address().to_string(), session.clone());
        buses.insert(system.address().to_string(), system.clone());
        Self {
            session,
            system,
            buses: Mutex::new(buses),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn session_bus(&self) -> &MemoryBus {
        &self.session
    }

    pub fn system_bus(&self) -> &MemoryBus {
        &self.system
    }

    /// Make an additional bus reachable by its address
    pub fn add_bus(&self, bus: MemoryBus) {
        self.buses.lock().insert(bus.address().to_string(), bus);
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn connect_bus(&self, kind: BusKind) -> std::result::Result<Arc<dyn Transport>, BusError> {
        let bus = match kind {
            BusKind::Session | BusKind::Activation => &self.session,
            BusKind::System => &self.system,
        };
        Ok(bus.connect())
    }

    fn connect_bus_address(&self, address: &str) -> std::result::Result<Arc<dyn Transport>, BusError> {
        let bus = self.buses.lock().get(address).cloned();
        match bus {
            Some(bus) => Ok(bus.connect()),
            None => Err(WireError::NoServer(address.to_string()).into()),
        }
    }

    fn connect_peer(&self, address: &str) -> std::result::Result<Arc<dyn Transport>, BusError> {
        let listener = self.listeners.lock().get(address).and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.accept(),
            None => Err(WireError::NoServer(address.to_string()).into()),
        }
    }

    fn listen(&self, address: &str) -> std::result::Result<Arc<dyn Listener>, BusError> {
        let address = if address.is_empty() || address == "memory:" {
            format!(
                "memory:peer={}",
                self.next_listener.fetch_add(1, Ordering::SeqCst)
            )
        } else if address.starts_with("memory:") {
            address.to_string()
        } else {
            return Err(WireError::BadAddress(address.to_string()).into());
        };

        let mut listeners = self.listeners.lock();
        let occupied = listeners
            .get(&address)
            .and_then(Weak::upgrade)
            .map_or(false, |l| l.is_listening());
        if occupied {
            return Err(BusError::new(
                ErrorType::AddressInUse,
                format!("Address {} is already in use", address),
            ));
        }
        let listener = Arc::new(MemoryListener {
            address: address.clone(),
            machine_id: self.session.id().to_string(),
            listening: AtomicBool::new(true),
            handler: Mutex::new(None),
        });
        listeners.insert(address.clone(), Arc::downgrade(&listener));
        info!("listening on {}", address);
        Ok(listener)
    }
}

/// A 32 hex digit identifier
fn generate_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mixed = nanos ^ ((std::process::id() as u128) << 64)
        ^ (COUNTER.fetch_add(1, Ordering::Relaxed) as u128).rotate_left(96);
    format!("{:032x}", mixed)
}
