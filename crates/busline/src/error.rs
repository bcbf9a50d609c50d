//! Error types for the connection engine

use busline_wire::{BusError, ErrorType};
use thiserror::Error;

/// Failure reported by an exported method handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MethodError {
    /// The handler could not run; answered with an internal error
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler answers with this D-Bus error
    #[error("{0}")]
    Dbus(BusError),
}

impl MethodError {
    pub fn failed(text: impl Into<String>) -> Self {
        MethodError::Failed(text.into())
    }

    pub fn dbus(kind: ErrorType, text: impl Into<String>) -> Self {
        MethodError::Dbus(BusError::new(kind, text))
    }
}

impl From<BusError> for MethodError {
    fn from(err: BusError) -> Self {
        MethodError::Dbus(err)
    }
}

pub type MethodResult = std::result::Result<Vec<busline_wire::Value>, MethodError>;

pub type Result<T> = std::result::Result<T, BusError>;

/// Standard error texts produced by dispatch
pub(crate) mod texts {
    pub(crate) fn no_such_method(member: &str, interface: &str, path: &str, signature: &str) -> String {
        let interface = if interface.is_empty() {
            "any interface".to_string()
        } else {
            format!("interface '{}'", interface)
        };
        format!(
            "No such method '{}' in {} at object path '{}' (signature '{}')",
            member, interface, path, signature
        )
    }

    pub(crate) fn no_such_interface(interface: &str, path: &str) -> String {
        format!("No such interface '{}' at object path '{}'", interface, path)
    }

    pub(crate) fn no_such_object(path: &str) -> String {
        format!("No such object path '{}'", path)
    }

    pub(crate) fn local_call_failed(interface: &str, member: &str, path: &str, signature: &str) -> String {
        let interface = if interface.is_empty() {
            "<no-interface>"
        } else {
            interface
        };
        format!(
            "Internal error trying to call {}.{} at {} (signature '{}'",
            interface, member, path, signature
        )
    }

    pub(crate) const LOCAL_DELAYED_REPLY: &str = "local-loop message cannot have delayed replies";

    pub(crate) const DELIVERY_FAILED: &str = "Failed to deliver message";

    pub(crate) const NOT_CONNECTED: &str = "Not connected to server";

    pub(crate) const OUT_OF_MEMORY: &str = "Out of memory";

    pub(crate) const NOT_CONNECTED_TO_BUS: &str = "Not connected to D-Bus server";

    pub(crate) const NO_REPLY: &str = "Did not receive a reply. Possible causes include: \
        the remote application did not send a reply, the message bus security policy \
        blocked the reply, the reply timeout expired, or the network connection was broken.";

    pub(crate) fn unexpected_signature(got: &str, expected: &str) -> String {
        format!("Unexpected reply signature: got \"{}\", expected \"{}\"", got, expected)
    }

    pub(crate) fn object_has_no_thread(name: &str, path: &str) -> String {
        format!(
            "Object '{}' (at path '{}') has no thread. Cannot deliver message.",
            name, path
        )
    }
}
