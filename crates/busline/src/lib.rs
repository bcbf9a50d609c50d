//! D-Bus connection engine
//!
//! `busline` manages named connections to message buses and peers, routes
//! incoming method calls to exported objects by path, delivers signals to
//! subscribers, and tracks outstanding calls. Transports are supplied
//! through the [`busline_wire::Connector`] contract.
//!
//! ```text
//!   ConnectionRegistry ──open(name)──▶ ConnectionHandle ──▶ Connection
//!                                                            │
//!        ┌────────────────────────────┬──────────────────────┼─────────────────┐
//!        ▼                            ▼                      ▼                 ▼
//!    ObjectTree                SignalHookTable          PendingCall      Transport
//!    path → object             member:iface → hooks     reply tracking   (busline-wire)
//!        │                            │
//!        └──── posted to the object's home LoopHandle ────┘
//! ```
//!
//! Every exported object has a home task queue ([`LoopHandle`]): calls and
//! signal deliveries run there, in arrival order, when that thread pumps
//! its queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use busline::{
//!     CallContext, CallMode, ConnectionConfig, ConnectionRegistry, ExportedObject,
//!     MethodDescriptor, MethodResult, ObjectRef, RegisterOptions,
//! };
//! use busline_wire::{BusKind, MemoryConnector, Message};
//!
//! struct Echo;
//!
//! impl ExportedObject for Echo {
//!     fn interface(&self) -> &str {
//!         "org.example.Echo"
//!     }
//!
//!     fn methods(&self) -> Vec<MethodDescriptor> {
//!         vec![MethodDescriptor::slot("Echo", "s", "s")]
//!     }
//!
//!     fn invoke(&self, _method: &str, ctx: &CallContext<'_>) -> MethodResult {
//!         Ok(ctx.args().to_vec())
//!     }
//! }
//!
//! let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new()), ConnectionConfig::default());
//! let conn = registry.connect_to_bus(BusKind::Session, "session");
//! let echo = ObjectRef::new(Echo);
//! conn.register_object("/echo", &echo, RegisterOptions::EXPORT_ALL_SLOTS);
//!
//! let call = Message::method_call(conn.base_service(), "/echo", "org.example.Echo", "Echo")
//!     .with_arg("hello");
//! let reply = conn.call(call, CallMode::BlockWithGui, -1);
//! assert_eq!(reply.args()[0].as_str(), Some("hello"));
//! ```

pub mod bus_interface;
pub mod config;
mod connection;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod export;
mod handle;
mod introspect;
pub mod object_tree;
pub mod pending;
mod registry;
mod signal_hooks;

pub use bus_interface::BusInterface;
pub use config::ConnectionConfig;
pub use connection::{CallMode, ConnectionMode, SignalMatch};
pub use context::{CallContext, DelayedReply};
pub use error::{MethodError, MethodResult, Result};
pub use event_loop::{LoopHandle, Task, TimerId};
pub use export::{
    ExportedObject, MemberKind, MethodDescriptor, ObjectBuilder, ObjectId, ObjectRef,
    PropertyAccess, PropertyDescriptor, RegisterOptions, SignalDescriptor, VirtualObject,
    VirtualObjectMode,
};
pub use handle::ConnectionHandle;
pub use object_tree::UnregisterMode;
pub use pending::{CallStatus, PendingCall};
pub use registry::{ConnectionRegistry, Establish};
