//! Method calls: blocking, cooperative, asynchronous and loopback

use std::sync::Arc;
use std::time::{Duration, Instant};

use busline_wire::{BusError, ErrorType, Message, WireError};
use tracing::{debug, warn};

use super::{Connection, ConnectionMode};
use crate::context::IncomingCall;
use crate::error::texts;
use crate::event_loop::LoopHandle;
use crate::export::{ObjectKind, ObjectRef};
use crate::pending::{PendingCall, ReplyCallback};

/// Extra time a cooperative wait pumps past the call's own timeout, so the
/// transport's expiry normally arrives first
const EXPIRY_GRACE: Duration = Duration::from_secs(1);

/// How [`call`](crate::ConnectionHandle::call) waits for its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallMode {
    /// Send and return at once; the result is an invalid message
    NoBlock,
    /// Block the thread without processing its queue
    Block,
    /// Keep processing the calling thread's queue while waiting
    #[default]
    BlockWithGui,
    /// Same as `BlockWithGui`
    AutoDetect,
}

impl Connection {
    fn not_connected(&self) -> BusError {
        let error = BusError::new(ErrorType::Disconnected, texts::NOT_CONNECTED_TO_BUS);
        self.set_last_error(Some(error.clone()));
        error
    }

    /// True if `msg` can be answered by this connection's own objects
    /// without leaving the thread
    fn is_loopback(&self, msg: &Message) -> bool {
        self.config.loopback_calls && self.home.is_current() && self.is_own_service(msg.destination())
    }

    pub(crate) fn call(self: &Arc<Self>, msg: Message, mode: CallMode, timeout_ms: i32) -> Message {
        if !self.is_connected() {
            return Message::error(&self.not_connected());
        }
        if mode == CallMode::NoBlock {
            self.send(msg);
            return Message::default();
        }

        let reply = if self.is_loopback(&msg) {
            self.send_with_reply_local(&msg)
        } else if mode == CallMode::Block || LoopHandle::existing().is_none() {
            self.call_blocking(msg, self.config.timeout_for(timeout_ms))
        } else {
            self.call_cooperative(msg, timeout_ms)
        };
        self.set_last_error(reply.to_error());
        reply
    }

    fn call_blocking(&self, msg: Message, timeout: Duration) -> Message {
        let Some(transport) = self.transport() else {
            return Message::error(&self.not_connected());
        };
        if let Err(err) = msg.validate() {
            warn!("refusing to send {} to '{}': {}", msg.member(), msg.destination(), err);
            return msg.create_error_reply(&err.into());
        }
        match transport.send_with_reply_and_block(msg.clone(), timeout) {
            Ok(reply) => reply,
            Err(WireError::Timeout) => msg.create_error_reply_of(ErrorType::NoReply, texts::NO_REPLY),
            Err(err) => msg.create_error_reply(&err.into()),
        }
    }

    /// Pump the calling thread's queue until the call finishes
    fn call_cooperative(self: &Arc<Self>, msg: Message, timeout_ms: i32) -> Message {
        let pending = self.async_call_inner(msg, None, None, timeout_ms);
        let waiter = LoopHandle::current();
        pending.add_loop_waiter(waiter.clone());

        let deadline = Instant::now() + self.config.timeout_for(timeout_ms) + EXPIRY_GRACE;
        let watched = pending.clone();
        waiter.run_until(move || watched.is_finished(), Some(deadline));
        if !pending.is_finished() {
            debug!("'{}' still waiting on call {} past its deadline", self.name, pending.serial());
            pending.wait_for_finished();
        }
        pending.reply().unwrap_or_default()
    }

    /// Deliver a call to this connection's own objects and collect the
    /// reply they produce
    fn send_with_reply_local(self: &Arc<Self>, msg: &Message) -> Message {
        let mut local = msg.clone();
        local.set_sender(self.base_service());
        let call = IncomingCall::local(local);
        if !self.handle_message(call.clone()) {
            return msg.create_error_reply_of(
                ErrorType::InternalError,
                texts::local_call_failed(msg.interface(), msg.member(), msg.path(), &msg.signature()),
            );
        }
        match call.take_local_reply() {
            Some(reply) => reply,
            None => {
                warn!(
                    "{}.{} at {} did not reply on the local loop",
                    msg.interface(),
                    msg.member(),
                    msg.path()
                );
                msg.create_error_reply_of(ErrorType::InternalError, texts::LOCAL_DELAYED_REPLY)
            }
        }
    }

    pub(crate) fn async_call(self: &Arc<Self>, msg: Message, timeout_ms: i32) -> PendingCall {
        self.async_call_inner(msg, None, None, timeout_ms)
    }

    pub(super) fn async_call_inner(
        self: &Arc<Self>,
        msg: Message,
        callback: Option<ReplyCallback>,
        expected: Option<String>,
        timeout_ms: i32,
    ) -> PendingCall {
        let connection = Arc::downgrade(self);
        if !self.is_connected() {
            let error = self.not_connected();
            return PendingCall::failed(msg, callback, connection, &error);
        }
        if self.is_loopback(&msg) {
            let reply = self.send_with_reply_local(&msg);
            let call = PendingCall::new(msg, expected, callback, connection, None);
            call.finish(Some(reply));
            return call;
        }
        let Some(transport) = self.transport() else {
            let error = self.not_connected();
            return PendingCall::failed(msg, callback, connection, &error);
        };
        if let Err(err) = msg.validate() {
            warn!("refusing to send {} to '{}': {}", msg.member(), msg.destination(), err);
            return PendingCall::failed(msg, callback, connection, &err.into());
        }

        let call = PendingCall::new(
            msg.clone(),
            expected,
            callback,
            connection,
            Some(Arc::downgrade(&transport)),
        );
        if self.mode() == ConnectionMode::Peer {
            self.peer_pending.lock().push(call.clone());
        }
        let notified = call.clone();
        let timeout = self.config.timeout_for(timeout_ms);
        match transport.send_with_reply(msg, timeout, Box::new(move |reply| notified.finish(reply))) {
            Ok(serial) => call.set_serial(serial),
            Err(err) => {
                let error = match err {
                    WireError::NoMemory => BusError::new(ErrorType::NoMemory, texts::OUT_OF_MEMORY),
                    _ => BusError::new(ErrorType::Disconnected, texts::NOT_CONNECTED),
                };
                warn!("'{}' failed to send {}: {}", self.name, call.request().member(), err);
                self.set_last_error(Some(error.clone()));
                call.finish(Some(call.request().create_error_reply(&error)));
            }
        }
        call
    }

    /// Call and deliver the outcome to declared methods of `target`
    pub(crate) fn call_with_callback(
        self: &Arc<Self>,
        msg: Message,
        target: &ObjectRef,
        reply_slot: &str,
        error_slot: Option<&str>,
        timeout_ms: i32,
    ) -> bool {
        if !self.is_connected() {
            self.not_connected();
            return false;
        }
        if !matches!(target.kind(), ObjectKind::Exported(_)) {
            return false;
        }
        let slots = target.slots();
        let Some(reply_index) = slots.by_name(reply_slot) else {
            warn!("{} has no method '{}' to receive a reply", target.id(), reply_slot);
            return false;
        };
        let error_index = match error_slot {
            Some(name) => match slots.by_name(name) {
                Some(index) => Some(index),
                None => {
                    warn!("{} has no method '{}' to receive an error", target.id(), name);
                    return false;
                }
            },
            None => None,
        };
        let method = slots.get(reply_index);
        let expected = (!method.takes_message).then(|| method.input.clone());
        let callback = ReplyCallback {
            target: target.clone(),
            reply_slot: reply_index,
            error_slot: error_index,
        };
        self.async_call_inner(msg, Some(callback), expected, timeout_ms);
        true
    }
}
