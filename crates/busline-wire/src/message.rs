//! D-Bus message model
//!
//! A [`Message`] carries the header fields the connection engine routes on
//! (type, destination, sender, path, interface, member, serials, error
//! name) and a typed argument list. Serial numbers are assigned by the
//! transport when the message is sent.

use bitflags::bitflags;

use crate::error::{BusError, ErrorType, Result, WireError};
use crate::names::{
    is_valid_bus_name, is_valid_error_name, is_valid_interface_name, is_valid_member_name,
    is_valid_object_path,
};
use crate::value::{signature_of, Value};

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    #[default]
    Invalid,
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

bitflags! {
    /// Header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x1;
        const NO_AUTO_START = 0x2;
    }
}

/// A D-Bus message
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    kind: MessageType,
    flags: MessageFlags,
    serial: u32,
    reply_serial: u32,
    destination: String,
    sender: String,
    path: String,
    interface: String,
    member: String,
    error_name: String,
    args: Vec<Value>,
}

impl Message {
    /// Create a method call
    pub fn method_call(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageType::MethodCall,
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            ..Default::default()
        }
    }

    /// Create a signal
    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageType::Signal,
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            ..Default::default()
        }
    }

    /// Create a standalone error message (not a reply to anything)
    pub fn error(error: &BusError) -> Self {
        Self {
            kind: MessageType::Error,
            error_name: error.name.clone(),
            args: vec![Value::String(error.message.clone())],
            ..Default::default()
        }
    }

    /// Create a standalone error message from a kind and text
    pub fn error_of(kind: ErrorType, text: impl Into<String>) -> Self {
        Self::error(&BusError::new(kind, text))
    }

    /// Create a method return answering this call
    pub fn create_reply(&self, args: Vec<Value>) -> Message {
        Message {
            kind: MessageType::MethodReturn,
            reply_serial: self.serial,
            destination: self.sender.clone(),
            args,
            ..Default::default()
        }
    }

    /// Create an error reply answering this call
    pub fn create_error_reply(&self, error: &BusError) -> Message {
        Message {
            kind: MessageType::Error,
            reply_serial: self.serial,
            destination: self.sender.clone(),
            error_name: error.name.clone(),
            args: vec![Value::String(error.message.clone())],
            ..Default::default()
        }
    }

    /// Create an error reply of a known kind
    pub fn create_error_reply_of(&self, kind: ErrorType, text: impl Into<String>) -> Message {
        self.create_error_reply(&BusError::new(kind, text))
    }

    /// Append an argument
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Replace the argument list
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn reply_serial(&self) -> u32 {
        self.reply_serial
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = destination.into();
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = sender.into();
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn error_name(&self) -> &str {
        &self.error_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    /// Body signature, computed from the arguments
    pub fn signature(&self) -> String {
        signature_of(&self.args)
    }

    /// True for method calls that expect an answer
    pub fn is_reply_required(&self) -> bool {
        self.kind == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Decode an error message into a [`BusError`]
    pub fn to_error(&self) -> Option<BusError> {
        if self.kind != MessageType::Error {
            return None;
        }
        let text = self
            .args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(BusError::named(self.error_name.clone(), text))
    }

    /// Check the header fields required by the message type
    pub fn validate(&self) -> Result<()> {
        let invalid = |text: String| Err(WireError::InvalidMessage(text));
        match self.kind {
            MessageType::Invalid => return invalid("Invalid message type".to_string()),
            MessageType::MethodCall => {
                if !self.destination.is_empty() && !is_valid_bus_name(&self.destination) {
                    return invalid(format!("Invalid service name: {}", self.destination));
                }
                if !is_valid_member_name(&self.member) {
                    return invalid(format!("Invalid method name: {}", self.member));
                }
            }
            MessageType::Signal => {
                if !is_valid_interface_name(&self.interface) {
                    return invalid(format!("Invalid interface class: {}", self.interface));
                }
                if !is_valid_member_name(&self.member) {
                    return invalid(format!("Invalid signal name: {}", self.member));
                }
            }
            MessageType::Error => {
                if !is_valid_error_name(&self.error_name) {
                    return invalid(format!("Invalid error name: {}", self.error_name));
                }
                return Ok(());
            }
            MessageType::MethodReturn => return Ok(()),
        }
        if !is_valid_object_path(&self.path) {
            return invalid(format!("Invalid object path: {}", self.path));
        }
        if !self.interface.is_empty() && !is_valid_interface_name(&self.interface) {
            return invalid(format!("Invalid interface class: {}", self.interface));
        }
        Ok(())
    }
}
