//! D-Bus wire layer for busline
//!
//! This crate holds everything the connection engine exchanges with the
//! outside world, without any byte-level encoding:
//!
//! - [`message`]: the [`Message`] model and its header fields
//! - [`value`]: typed arguments ([`Value`]) and their signatures
//! - [`signature`] / [`names`]: validation helpers
//! - [`match_rule`]: building and parsing signal match rules
//! - [`transport`]: the [`Transport`], [`Connector`] and [`Listener`]
//!   contracts the engine drives
//! - [`memory`]: an in-process bus implementing those contracts
//!
//! # Example
//!
//! ```
//! use busline_wire::{MemoryBus, Message, Transport};
//! use std::time::Duration;
//!
//! let bus = MemoryBus::default();
//! let conn = bus.connect();
//! let reply = conn
//!     .send_with_reply_and_block(
//!         Message::method_call(
//!             "org.freedesktop.DBus",
//!             "/org/freedesktop/DBus",
//!             "org.freedesktop.DBus",
//!             "GetId",
//!         ),
//!         Duration::from_secs(1),
//!     )
//!     .unwrap();
//! assert_eq!(reply.args()[0].as_str(), Some(bus.id()));
//! ```

pub mod error;
pub mod match_rule;
pub mod memory;
pub mod message;
pub mod names;
pub mod signature;
pub mod transport;
pub mod value;

pub use error::{BusError, ErrorType, Result, WireError, INTERNAL_ERROR_NAME};
pub use match_rule::MatchRule;
pub use memory::{
    MemoryBus, MemoryConnector, MemoryListener, MemoryTransport, DBUS_INTERFACE, DBUS_PATH,
    DBUS_SERVICE,
};
pub use message::{Message, MessageFlags, MessageType};
pub use transport::{
    BusKind, Capabilities, Connector, DispatchStatus, Listener, ReplyNotify, Timeout, TimeoutId,
    Transport, TransportEvents, Watch, WatchFlags, WatchId,
};
pub use value::Value;
