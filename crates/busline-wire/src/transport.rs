//! Transport collaborator contracts
//!
//! The connection engine never touches sockets or bytes. It drives a
//! [`Transport`] that:
//!
//! - sends whole messages and tracks replies by serial;
//! - queues incoming messages until the engine pops them on its home
//!   thread, announcing new data through [`TransportEvents`];
//! - reports the file-descriptor watches and timeouts it needs serviced.
//!
//! ```text
//!   engine ── send / send_with_reply ──────────────▶ Transport ──▶ bus
//!   engine ◀── dispatch_status_changed(DataRemains) ─ Transport ◀── bus
//!   engine ── pop_message (home thread) ───────────▶ Transport
//!   engine ◀── add_timeout / add_watch ───────────── Transport
//!   engine ── handle_timeout / handle_watch ───────▶ Transport
//! ```

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{BusError, Result};
use crate::message::Message;

bitflags! {
    /// Optional transport capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const UNIX_FD_PASSING = 0x1;
    }
}

bitflags! {
    /// Readiness conditions of a watched descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u32 {
        const READABLE = 0x1;
        const WRITABLE = 0x2;
    }
}

/// Identifies a watch inside one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Identifies a timeout inside one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutId(pub u64);

/// A file descriptor the transport wants polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    pub id: WatchId,
    pub fd: i32,
    pub flags: WatchFlags,
    pub enabled: bool,
}

/// A timer the transport wants fired once after `interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub id: TimeoutId,
    pub interval: Duration,
    pub enabled: bool,
}

/// Whether the transport has incoming messages waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    DataRemains,
    Complete,
}

/// Notification invoked exactly once per tracked call.
///
/// `None` means no reply will arrive: the call timed out, or the
/// connection went away.
pub type ReplyNotify = Box<dyn FnOnce(Option<Message>) + Send + 'static>;

/// Callbacks from the transport into the connection engine.
///
/// May be invoked from any thread, including re-entrantly from inside a
/// [`Transport`] method called by the engine.
pub trait TransportEvents: Send + Sync {
    /// Start servicing a watch. Returns false if it cannot be serviced.
    fn add_watch(&self, watch: Watch) -> bool;

    fn remove_watch(&self, id: WatchId);

    fn toggle_watch(&self, id: WatchId, enabled: bool);

    /// Arm a one-shot timeout. Returns false if it cannot be armed.
    fn add_timeout(&self, timeout: Timeout) -> bool;

    fn remove_timeout(&self, id: TimeoutId);

    fn dispatch_status_changed(&self, status: DispatchStatus);

    /// The remote end went away
    fn disconnected(&self);
}

/// An established connection to a bus or peer
pub trait Transport: Send + Sync {
    /// Unique name assigned by the bus; empty for peer connections
    fn unique_name(&self) -> String;

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Identifier of the machine the bus runs on
    fn machine_id(&self) -> String;

    /// Install the engine's callbacks. Called once, before any traffic.
    fn set_events(&self, events: Arc<dyn TransportEvents>);

    /// Send without tracking a reply. Returns the serial assigned.
    fn send(&self, msg: Message) -> Result<u32>;

    /// Send and track the reply; `notify` fires exactly once
    fn send_with_reply(&self, msg: Message, timeout: Duration, notify: ReplyNotify) -> Result<u32>;

    /// Block the calling thread until the call with `serial` completes or
    /// its deadline passes, completing it in the latter case
    fn block_pending(&self, serial: u32);

    /// Send and block the calling thread until the reply arrives.
    ///
    /// Expiry yields `Err(WireError::Timeout)`.
    fn send_with_reply_and_block(&self, msg: Message, timeout: Duration) -> Result<Message>;

    /// Next queued incoming message, in arrival order
    fn pop_message(&self) -> Option<Message>;

    /// Register a signal match rule with the bus
    fn add_match(&self, rule: &str) -> Result<()>;

    fn remove_match(&self, rule: &str) -> Result<()>;

    /// Service readiness on a watch
    fn handle_watch(&self, _id: WatchId, _flags: WatchFlags) -> bool {
        true
    }

    /// A timeout armed through [`TransportEvents::add_timeout`] fired
    fn handle_timeout(&self, id: TimeoutId);

    fn is_connected(&self) -> bool;

    /// Close the connection and fail every tracked call
    fn close(&self);
}

/// Kinds of well-known buses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    Session,
    System,
    /// The bus that started this process, if any
    Activation,
}

/// Accepts incoming peer connections
pub trait Listener: Send + Sync {
    /// Address clients connect to
    fn address(&self) -> String;

    /// Install the handler receiving each accepted peer transport
    fn set_new_connection_handler(&self, handler: Box<dyn Fn(Arc<dyn Transport>) + Send + Sync>);

    fn is_listening(&self) -> bool;

    fn close(&self);
}

/// Establishes transports
pub trait Connector: Send + Sync {
    fn connect_bus(&self, kind: BusKind) -> std::result::Result<Arc<dyn Transport>, BusError>;

    fn connect_bus_address(&self, address: &str) -> std::result::Result<Arc<dyn Transport>, BusError>;

    fn connect_peer(&self, address: &str) -> std::result::Result<Arc<dyn Transport>, BusError>;

    fn listen(&self, address: &str) -> std::result::Result<Arc<dyn Listener>, BusError>;
}
