//! Public handle to a connection

use std::sync::Arc;

use busline_wire::{BusError, Capabilities, Message, Watch, WatchFlags};
use tracing::debug;

use crate::bus_interface::{name_flags, release_reply, request_reply, BusInterface};
use crate::connection::{CallMode, Connection, ConnectionMode, SignalMatch};
use crate::export::{ObjectRef, RegisterOptions, VirtualObjectMode};
use crate::object_tree::UnregisterMode;
use crate::pending::PendingCall;

/// Receives each peer connection accepted by a server
pub(crate) type NewConnectionHandler = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;

/// Cheap, cloneable reference to a connection
///
/// The connection lives while any handle, or the registry entry, refers
/// to it.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Connection>,
}

impl ConnectionHandle {
    pub(crate) fn from_inner(inner: Arc<Connection>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Connection> {
        &self.inner
    }

    /// Registry name of the connection
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner.mode()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Error of the last failed operation, if it failed
    pub fn last_error(&self) -> Option<BusError> {
        self.inner.last_error()
    }

    /// Unique name assigned by the bus; empty unless connected to one
    pub fn base_service(&self) -> String {
        self.inner.base_service()
    }

    pub fn connection_capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    pub fn local_machine_id(&self) -> String {
        self.inner.machine_id()
    }

    /// Address a server-mode connection listens on
    pub fn address(&self) -> Option<String> {
        self.inner.listener_address()
    }

    /// Send without waiting for a reply. Returns the serial, 0 on failure.
    pub fn send(&self, msg: Message) -> u32 {
        self.inner.send(msg)
    }

    /// Call and wait for the reply as `mode` says. `timeout_ms < 0` uses
    /// the configured default.
    pub fn call(&self, msg: Message, mode: CallMode, timeout_ms: i32) -> Message {
        self.inner.call(msg, mode, timeout_ms)
    }

    pub fn async_call(&self, msg: Message, timeout_ms: i32) -> PendingCall {
        self.inner.async_call(msg, timeout_ms)
    }

    /// Call and deliver the reply to the declared method `reply_slot` of
    /// `target`, or an error reply to `error_slot`
    pub fn call_with_callback(
        &self,
        msg: Message,
        target: &ObjectRef,
        reply_slot: &str,
        error_slot: Option<&str>,
        timeout_ms: i32,
    ) -> bool {
        self.inner
            .call_with_callback(msg, target, reply_slot, error_slot, timeout_ms)
    }

    /// Deliver matching signals to the declared method `slot` of `target`
    pub fn connect_signal(&self, filter: &SignalMatch, target: &ObjectRef, slot: &str) -> bool {
        self.inner.connect_signal(filter, target, slot)
    }

    pub fn disconnect_signal(&self, filter: &SignalMatch, target: &ObjectRef, slot: &str) -> bool {
        self.inner.disconnect_signal(filter, target, slot)
    }

    pub fn register_object(&self, path: &str, object: &ObjectRef, options: RegisterOptions) -> bool {
        self.inner.register_object(path, object, options)
    }

    pub fn register_virtual_object(&self, path: &str, object: &ObjectRef, mode: VirtualObjectMode) -> bool {
        self.inner.register_virtual_object(path, object, mode)
    }

    pub fn unregister_object(&self, path: &str, mode: UnregisterMode) {
        self.inner.unregister_object(path, mode)
    }

    pub fn object_registered_at(&self, path: &str) -> Option<ObjectRef> {
        self.inner.object_registered_at(path)
    }

    /// Driver calls; bus connections only
    pub fn bus_interface(&self) -> Option<BusInterface> {
        (self.inner.mode() == ConnectionMode::Client).then(|| BusInterface::new(&self.inner))
    }

    /// Own the well-known `name`. Peer connections record it locally.
    pub fn register_service(&self, name: &str) -> bool {
        match self.inner.mode() {
            ConnectionMode::Peer => {
                self.inner.record_service(name);
                true
            }
            ConnectionMode::Client => {
                let bus = BusInterface::new(&self.inner);
                match bus.request_name(name, name_flags::DO_NOT_QUEUE) {
                    Ok(request_reply::PRIMARY_OWNER | request_reply::ALREADY_OWNER) => {
                        self.inner.record_service(name);
                        true
                    }
                    Ok(code) => {
                        debug!("'{}' could not own {}: reply {}", self.name(), name, code);
                        false
                    }
                    Err(error) => {
                        self.inner.set_last_error(Some(error));
                        false
                    }
                }
            }
            ConnectionMode::Server | ConnectionMode::Invalid => false,
        }
    }

    pub fn unregister_service(&self, name: &str) -> bool {
        match self.inner.mode() {
            ConnectionMode::Peer => {
                self.inner.forget_service(name);
                true
            }
            ConnectionMode::Client => {
                let bus = BusInterface::new(&self.inner);
                let released = bus.release_name(name);
                self.inner.forget_service(name);
                match released {
                    Ok(code) => code == release_reply::RELEASED,
                    Err(error) => {
                        self.inner.set_last_error(Some(error));
                        false
                    }
                }
            }
            ConnectionMode::Server | ConnectionMode::Invalid => false,
        }
    }

    /// Names this connection owns
    pub fn service_names(&self) -> Vec<String> {
        self.inner.service_names()
    }

    /// Receive peer connections accepted by this server
    pub fn set_new_connection_handler<F>(&self, handler: F)
    where
        F: Fn(ConnectionHandle) + Send + Sync + 'static,
    {
        self.inner.set_new_connection_handler(Arc::new(handler));
    }

    /// Readiness of `fd` reported by an external poller
    pub fn socket_ready(&self, fd: i32, readiness: WatchFlags) {
        self.inner.socket_ready(fd, readiness)
    }

    /// Watches the transport asked for
    pub fn watches(&self) -> Vec<Watch> {
        self.inner.watches()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ConnectionHandle {}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name())
            .field("mode", &self.mode())
            .finish()
    }
}
