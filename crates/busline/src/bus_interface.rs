//! Calls to the bus driver, `org.freedesktop.DBus`

use std::sync::{Arc, Weak};

use busline_wire::{BusError, ErrorType, Message, Value, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE};
use tracing::debug;

use crate::connection::{CallMode, Connection};
use crate::error::{texts, Result};

/// `RequestName` flags
pub mod name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    pub const REPLACE_EXISTING: u32 = 0x2;
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// `RequestName` replies
pub mod request_reply {
    pub const PRIMARY_OWNER: u32 = 1;
    pub const IN_QUEUE: u32 = 2;
    pub const EXISTS: u32 = 3;
    pub const ALREADY_OWNER: u32 = 4;
}

/// `ReleaseName` replies
pub mod release_reply {
    pub const RELEASED: u32 = 1;
    pub const NON_EXISTENT: u32 = 2;
    pub const NOT_OWNER: u32 = 3;
}

/// Blocking calls to the bus driver through one connection
#[derive(Clone)]
pub struct BusInterface {
    connection: Weak<Connection>,
}

fn first_arg(reply: &Message) -> Result<&Value> {
    reply.args().first().ok_or_else(|| {
        BusError::new(
            ErrorType::InvalidSignature,
            format!("Unexpected empty reply to {}", reply.member()),
        )
    })
}

fn unexpected(value: &Value, expected: &str) -> BusError {
    BusError::new(
        ErrorType::InvalidSignature,
        texts::unexpected_signature(&value.signature(), expected),
    )
}

impl BusInterface {
    pub(crate) fn new(connection: &Arc<Connection>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
        }
    }

    fn call(&self, member: &str, args: Vec<Value>) -> Result<Message> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| BusError::new(ErrorType::Disconnected, texts::NOT_CONNECTED_TO_BUS))?;
        let msg = Message::method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, member).with_args(args);
        let reply = connection.call(msg, CallMode::Block, -1);
        match reply.to_error() {
            Some(error) => Err(error),
            None => Ok(reply),
        }
    }

    fn call_u32(&self, member: &str, args: Vec<Value>) -> Result<u32> {
        let reply = self.call(member, args)?;
        let value = first_arg(&reply)?;
        value.as_u32().ok_or_else(|| unexpected(value, "u"))
    }

    /// Ask the bus for `name`. Returns one of [`request_reply`].
    pub fn request_name(&self, name: &str, flags: u32) -> Result<u32> {
        debug!("requesting name {} (flags {:#x})", name, flags);
        self.call_u32("RequestName", vec![name.into(), flags.into()])
    }

    /// Give `name` back. Returns one of [`release_reply`].
    pub fn release_name(&self, name: &str) -> Result<u32> {
        self.call_u32("ReleaseName", vec![name.into()])
    }

    pub fn get_name_owner(&self, name: &str) -> Result<String> {
        let reply = self.call("GetNameOwner", vec![name.into()])?;
        let value = first_arg(&reply)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected(value, "s"))
    }

    pub fn name_has_owner(&self, name: &str) -> Result<bool> {
        let reply = self.call("NameHasOwner", vec![name.into()])?;
        let value = first_arg(&reply)?;
        value.as_bool().ok_or_else(|| unexpected(value, "b"))
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.call("ListNames", Vec::new())?;
        match first_arg(&reply)? {
            Value::Array { items, .. } => Ok(items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()),
            other => Err(unexpected(other, "as")),
        }
    }
}

impl std::fmt::Debug for BusInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInterface")
            .field("connected", &self.connection.upgrade().map_or(false, |c| c.is_connected()))
            .finish()
    }
}
