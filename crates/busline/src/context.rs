//! Call context handed to exported members
//!
//! A handler learns who called it, and may answer explicitly or promise a
//! later answer through a [`DelayedReply`]. Calls that arrive through the
//! local loop keep their reply in a shared slot instead of sending it.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use busline_wire::{BusError, ErrorType, Message, Value};
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::handle::ConnectionHandle;

/// A method call (or signal, or reply) being delivered to an object
#[derive(Clone)]
pub(crate) struct IncomingCall {
    message: Message,
    /// Reply slot of a local-loop call
    local_reply: Option<Arc<Mutex<Option<Message>>>>,
}

impl IncomingCall {
    pub(crate) fn remote(message: Message) -> Self {
        Self {
            message,
            local_reply: None,
        }
    }

    pub(crate) fn local(message: Message) -> Self {
        Self {
            message,
            local_reply: Some(Arc::new(Mutex::new(None))),
        }
    }

    pub(crate) fn message(&self) -> &Message {
        &self.message
    }

    pub(crate) fn is_local(&self) -> bool {
        self.local_reply.is_some()
    }

    /// Keep the first reply of a local-loop call
    pub(crate) fn store_local_reply(&self, reply: Message) -> bool {
        match &self.local_reply {
            Some(slot) => {
                let mut slot = slot.lock();
                if slot.is_some() {
                    return false;
                }
                *slot = Some(reply);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_local_reply(&self) -> Option<Message> {
        self.local_reply.as_ref().and_then(|slot| slot.lock().take())
    }
}

/// What a handler sees of the message it is handling
pub struct CallContext<'a> {
    connection: &'a Arc<Connection>,
    call: &'a IncomingCall,
    responded: Cell<bool>,
    delayed: Cell<bool>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(connection: &'a Arc<Connection>, call: &'a IncomingCall) -> Self {
        Self {
            connection,
            call,
            responded: Cell::new(false),
            delayed: Cell::new(false),
        }
    }

    pub fn message(&self) -> &Message {
        self.call.message()
    }

    pub fn args(&self) -> &[Value] {
        self.call.message().args()
    }

    /// Unique name of the caller; empty on peer connections
    pub fn sender(&self) -> &str {
        self.call.message().sender()
    }

    /// Connection the message arrived on
    pub fn connection(&self) -> ConnectionHandle {
        ConnectionHandle::from_inner(self.connection.clone())
    }

    /// True for calls short-circuited through the local loop
    pub fn is_local(&self) -> bool {
        self.call.is_local()
    }

    /// Answer the call now, replacing the automatic reply
    pub fn send_reply(&self, args: Vec<Value>) -> bool {
        let reply = self.call.message().create_reply(args);
        self.respond(reply)
    }

    pub fn send_error_reply(&self, kind: ErrorType, text: impl Into<String>) -> bool {
        let reply = self.call.message().create_error_reply_of(kind, text);
        self.respond(reply)
    }

    pub fn send_error(&self, error: &BusError) -> bool {
        let reply = self.call.message().create_error_reply(error);
        self.respond(reply)
    }

    /// Promise to answer later. The automatic reply is suppressed.
    pub fn set_delayed_reply(&self) -> DelayedReply {
        self.delayed.set(true);
        DelayedReply {
            connection: Arc::downgrade(self.connection),
            call: self.call.clone(),
        }
    }

    pub(crate) fn responded(&self) -> bool {
        self.responded.get()
    }

    pub(crate) fn is_delayed(&self) -> bool {
        self.delayed.get()
    }

    fn respond(&self, reply: Message) -> bool {
        if self.responded.replace(true) {
            debug!("'{}' already answered", self.call.message().member());
            return false;
        }
        self.connection.send_reply_to(self.call, reply)
    }
}

/// A reply promised by a handler, sendable from any thread
pub struct DelayedReply {
    connection: Weak<Connection>,
    call: IncomingCall,
}

impl DelayedReply {
    /// The call being answered
    pub fn message(&self) -> &Message {
        self.call.message()
    }

    pub fn send_reply(self, args: Vec<Value>) -> bool {
        let reply = self.call.message().create_reply(args);
        self.finish(reply)
    }

    pub fn send_error_reply(self, kind: ErrorType, text: impl Into<String>) -> bool {
        let reply = self.call.message().create_error_reply_of(kind, text);
        self.finish(reply)
    }

    fn finish(self, reply: Message) -> bool {
        match self.connection.upgrade() {
            Some(connection) => connection.send_reply_to(&self.call, reply),
            None => {
                debug!("connection gone before delayed reply to '{}'", self.call.message().member());
                false
            }
        }
    }
}

thread_local! {
    static SENDERS: RefCell<Vec<Weak<Connection>>> = const { RefCell::new(Vec::new()) };
}

/// Marks the connection delivering to user code on this thread
pub(crate) struct SenderGuard;

impl SenderGuard {
    pub(crate) fn enter(connection: &Arc<Connection>) -> Self {
        SENDERS.with(|s| s.borrow_mut().push(Arc::downgrade(connection)));
        SenderGuard
    }
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        let _ = SENDERS.try_with(|s| s.borrow_mut().pop());
    }
}

/// Connection whose delivery is running on this thread
pub(crate) fn current_sender() -> Option<Arc<Connection>> {
    SENDERS
        .try_with(|s| s.borrow().last().and_then(Weak::upgrade))
        .ok()
        .flatten()
}
