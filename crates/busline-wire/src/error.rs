//! Error types for the D-Bus wire layer
//!
//! Two families live here:
//!
//! - [`WireError`]: failures of transport operations (send, match rules,
//!   establishment). These never travel on the bus.
//! - [`ErrorType`] / [`BusError`]: named D-Bus errors, as carried by error
//!   replies and reported through a connection's last error.

use thiserror::Error;

/// Transport-level error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("not connected")]
    Disconnected,

    #[error("out of memory")]
    NoMemory,

    #[error("timeout")]
    Timeout,

    #[error("no server listening on {0}")]
    NoServer(String),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid match rule: {0}")]
    InvalidMatchRule(String),

    #[error("match rule not found: {0}")]
    MatchRuleNotFound(String),

    #[error("bus error: {0}")]
    Bus(BusError),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// Prefix shared by the standard error names
const STANDARD_PREFIX: &str = "org.freedesktop.DBus.Error.";

/// Name of the error used for failures inside the connection engine itself
pub const INTERNAL_ERROR_NAME: &str = "org.busline.Error.InternalError";

/// Known D-Bus error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    NoError,
    Other,
    Failed,
    NoMemory,
    ServiceUnknown,
    NoReply,
    BadAddress,
    NotSupported,
    LimitsExceeded,
    AccessDenied,
    NoServer,
    Timeout,
    NoNetwork,
    AddressInUse,
    Disconnected,
    InvalidArgs,
    UnknownMethod,
    TimedOut,
    InvalidSignature,
    UnknownInterface,
    UnknownObject,
    UnknownProperty,
    PropertyReadOnly,
    InternalError,
    InvalidService,
    InvalidObjectPath,
    InvalidInterface,
    InvalidMember,
    NameHasNoOwner,
    MatchRuleNotFound,
}

/// Table of standard suffixes, indexed through [`ErrorType::suffix`]
const NAMED: &[(ErrorType, &str)] = &[
    (ErrorType::Failed, "Failed"),
    (ErrorType::NoMemory, "NoMemory"),
    (ErrorType::ServiceUnknown, "ServiceUnknown"),
    (ErrorType::NoReply, "NoReply"),
    (ErrorType::BadAddress, "BadAddress"),
    (ErrorType::NotSupported, "NotSupported"),
    (ErrorType::LimitsExceeded, "LimitsExceeded"),
    (ErrorType::AccessDenied, "AccessDenied"),
    (ErrorType::NoServer, "NoServer"),
    (ErrorType::Timeout, "Timeout"),
    (ErrorType::NoNetwork, "NoNetwork"),
    (ErrorType::AddressInUse, "AddressInUse"),
    (ErrorType::Disconnected, "Disconnected"),
    (ErrorType::InvalidArgs, "InvalidArgs"),
    (ErrorType::UnknownMethod, "UnknownMethod"),
    (ErrorType::TimedOut, "TimedOut"),
    (ErrorType::InvalidSignature, "InvalidSignature"),
    (ErrorType::UnknownInterface, "UnknownInterface"),
    (ErrorType::UnknownObject, "UnknownObject"),
    (ErrorType::UnknownProperty, "UnknownProperty"),
    (ErrorType::PropertyReadOnly, "PropertyReadOnly"),
    (ErrorType::InvalidService, "InvalidService"),
    (ErrorType::InvalidObjectPath, "InvalidObjectPath"),
    (ErrorType::InvalidInterface, "InvalidInterface"),
    (ErrorType::InvalidMember, "InvalidMember"),
    (ErrorType::NameHasNoOwner, "NameHasNoOwner"),
    (ErrorType::MatchRuleNotFound, "MatchRuleNotFound"),
];

impl ErrorType {
    fn suffix(self) -> Option<&'static str> {
        NAMED.iter().find(|(kind, _)| *kind == self).map(|(_, s)| *s)
    }

    /// Wire name of this error kind, empty for `NoError` and `Other`
    pub fn name(self) -> String {
        match self {
            ErrorType::NoError | ErrorType::Other => String::new(),
            ErrorType::InternalError => INTERNAL_ERROR_NAME.to_string(),
            kind => kind
                .suffix()
                .map(|s| format!("{}{}", STANDARD_PREFIX, s))
                .unwrap_or_default(),
        }
    }

    /// Map a wire name back to a kind. Unknown names map to `Other`.
    pub fn from_name(name: &str) -> ErrorType {
        if name.is_empty() {
            return ErrorType::NoError;
        }
        if name == INTERNAL_ERROR_NAME {
            return ErrorType::InternalError;
        }
        name.strip_prefix(STANDARD_PREFIX)
            .and_then(|suffix| NAMED.iter().find(|(_, s)| *s == suffix))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorType::Other)
    }
}

/// A named D-Bus error with its human-readable text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct BusError {
    /// Error kind
    pub kind: ErrorType,
    /// Wire name (kept verbatim for `Other`)
    pub name: String,
    /// Human-readable message
    pub message: String,
}

impl BusError {
    /// Create an error of a known kind
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: kind.name(),
            message: message.into(),
        }
    }

    /// Create an error from an arbitrary wire name
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: ErrorType::from_name(&name),
            name,
            message: message.into(),
        }
    }

    /// True unless this is the "no error" placeholder
    pub fn is_valid(&self) -> bool {
        self.kind != ErrorType::NoError
    }
}

impl From<WireError> for BusError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Disconnected => {
                BusError::new(ErrorType::Disconnected, "Not connected to server")
            }
            WireError::NoMemory => BusError::new(ErrorType::NoMemory, "Out of memory"),
            WireError::Timeout => BusError::new(ErrorType::Timeout, "Operation timed out"),
            WireError::NoServer(addr) => BusError::new(
                ErrorType::NoServer,
                format!("No server listening on {}", addr),
            ),
            WireError::BadAddress(addr) => {
                BusError::new(ErrorType::BadAddress, format!("Invalid address {}", addr))
            }
            WireError::InvalidMessage(text) => BusError::new(ErrorType::InvalidArgs, text),
            WireError::InvalidMatchRule(rule) => BusError::new(
                ErrorType::InvalidArgs,
                format!("Invalid match rule: {}", rule),
            ),
            WireError::MatchRuleNotFound(rule) => BusError::new(
                ErrorType::MatchRuleNotFound,
                format!("The given match rule wasn't found: {}", rule),
            ),
            WireError::Bus(err) => err,
        }
    }
}
