//! In-flight method calls
//!
//! A [`PendingCall`] is shared between the caller and the transport's
//! completion notification. It completes exactly once:
//!
//! ```text
//!   Sent ──reply──────────▶ RepliedOk | RepliedError
//!   Sent ──no reply───────▶ Expired   (timeout or disconnect)
//! ```
//!
//! Completion stores the reply, posts any reply callback to the target's
//! home queue, and wakes every kind of waiter: blocked threads, async
//! tasks awaiting the call, and home queues pumping until it finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use busline_wire::signature::starts_with_types;
use busline_wire::{BusError, ErrorType, Message, MessageType, Transport};
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::connection::Connection;
use crate::error::texts;
use crate::event_loop::LoopHandle;
use crate::export::ObjectRef;

/// Progress of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Sent,
    RepliedOk,
    RepliedError,
    /// No reply arrived: timed out, or the connection went away
    Expired,
}

/// Declared methods receiving a call's outcome
pub(crate) struct ReplyCallback {
    pub(crate) target: ObjectRef,
    pub(crate) reply_slot: usize,
    pub(crate) error_slot: Option<usize>,
}

struct CallState {
    status: CallStatus,
    reply: Option<Message>,
    /// A thread is blocked in the transport on this call
    waiting: bool,
}

struct PendingInner {
    sent: Message,
    /// Signature the reply must start with
    expected: Option<String>,
    callback: Mutex<Option<ReplyCallback>>,
    connection: Weak<Connection>,
    transport: Option<Weak<dyn Transport>>,
    serial: AtomicU32,
    state: Mutex<CallState>,
    finished: Condvar,
    waker: AtomicWaker,
    loop_waiters: Mutex<Vec<LoopHandle>>,
}

/// Handle to an asynchronous method call
#[derive(Clone)]
pub struct PendingCall {
    inner: Arc<PendingInner>,
}

impl PendingCall {
    pub(crate) fn new(
        sent: Message,
        expected: Option<String>,
        callback: Option<ReplyCallback>,
        connection: Weak<Connection>,
        transport: Option<Weak<dyn Transport>>,
    ) -> Self {
        Self {
            inner: Arc::new(PendingInner {
                sent,
                expected,
                callback: Mutex::new(callback),
                connection,
                transport,
                serial: AtomicU32::new(0),
                state: Mutex::new(CallState {
                    status: CallStatus::Sent,
                    reply: None,
                    waiting: false,
                }),
                finished: Condvar::new(),
                waker: AtomicWaker::new(),
                loop_waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A call that failed before it could be sent
    pub(crate) fn failed(
        sent: Message,
        callback: Option<ReplyCallback>,
        connection: Weak<Connection>,
        error: &BusError,
    ) -> Self {
        let reply = sent.create_error_reply(error);
        let call = Self::new(sent, None, callback, connection, None);
        call.finish(Some(reply));
        call
    }

    pub(crate) fn set_serial(&self, serial: u32) {
        self.inner.serial.store(serial, Ordering::SeqCst);
    }

    pub(crate) fn ptr_eq(&self, other: &PendingCall) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Serial of the request, 0 for calls never sent
    pub fn serial(&self) -> u32 {
        self.inner.serial.load(Ordering::SeqCst)
    }

    /// The request message
    pub fn request(&self) -> &Message {
        &self.inner.sent
    }

    pub fn status(&self) -> CallStatus {
        self.inner.state.lock().status
    }

    pub fn is_finished(&self) -> bool {
        self.status() != CallStatus::Sent
    }

    /// True once finished with an error of any kind
    pub fn is_error(&self) -> bool {
        matches!(self.status(), CallStatus::RepliedError | CallStatus::Expired)
    }

    /// The reply, once finished
    pub fn reply(&self) -> Option<Message> {
        self.inner.state.lock().reply.clone()
    }

    /// Error carried by the reply, if the call failed
    pub fn error(&self) -> Option<BusError> {
        self.inner
            .state
            .lock()
            .reply
            .as_ref()
            .and_then(Message::to_error)
    }

    fn disconnected(&self) -> bool {
        let transport_up = self
            .inner
            .transport
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |t| t.is_connected());
        let connection_up = self
            .inner
            .connection
            .upgrade()
            .map_or(false, |c| c.is_connected());
        !(transport_up && connection_up)
    }

    /// Complete the call. Later completions are ignored.
    ///
    /// `None` means no reply will ever arrive.
    pub(crate) fn finish(&self, reply: Option<Message>) {
        let sent = &self.inner.sent;
        let (reply, status) = match reply {
            None if self.disconnected() => (
                sent.create_error_reply_of(ErrorType::Disconnected, texts::NOT_CONNECTED),
                CallStatus::Expired,
            ),
            None => (
                sent.create_error_reply_of(ErrorType::NoReply, texts::NO_REPLY),
                CallStatus::Expired,
            ),
            Some(reply) if reply.kind() == MessageType::Error => (reply, CallStatus::RepliedError),
            Some(reply) => match &self.inner.expected {
                Some(expected) if !starts_with_types(&reply.signature(), expected) => (
                    sent.create_error_reply_of(
                        ErrorType::InvalidSignature,
                        texts::unexpected_signature(&reply.signature(), expected),
                    ),
                    CallStatus::RepliedError,
                ),
                _ => (reply, CallStatus::RepliedOk),
            },
        };

        {
            let mut state = self.inner.state.lock();
            if state.status != CallStatus::Sent {
                return;
            }
            state.status = status;
            state.reply = Some(reply.clone());
        }
        debug!(
            "call {} to {}.{} finished: {:?}",
            self.serial(),
            sent.interface(),
            sent.member(),
            status
        );

        let connection = self.inner.connection.upgrade();
        if let Some(connection) = &connection {
            connection.forget_pending(self);
        }

        let callback = self.inner.callback.lock().take();
        if let Some(callback) = callback {
            let slot = match reply.kind() {
                MessageType::Error => callback.error_slot,
                _ => Some(callback.reply_slot),
            };
            match (connection, slot) {
                (Some(connection), Some(slot)) => {
                    connection.post_slot_call(callback.target, slot, reply);
                }
                (None, _) => debug!("connection gone, dropping reply callback"),
                (_, None) => debug!("error reply with no error slot: {}", reply.error_name()),
            }
        }

        self.inner.finished.notify_all();
        self.inner.waker.wake();
        for waiter in self.inner.loop_waiters.lock().drain(..) {
            waiter.wake();
        }
    }

    /// Wake `waiter` when the call finishes
    pub(crate) fn add_loop_waiter(&self, waiter: LoopHandle) {
        self.inner.loop_waiters.lock().push(waiter);
        if self.is_finished() {
            for waiter in self.inner.loop_waiters.lock().drain(..) {
                waiter.wake();
            }
        }
    }

    /// Block the calling thread until the call finishes
    pub fn wait_for_finished(&self) {
        let mut state = self.inner.state.lock();
        if state.status != CallStatus::Sent {
            return;
        }
        if state.waiting {
            // another thread drives the transport; wait for its outcome
            while state.status == CallStatus::Sent {
                self.inner.finished.wait(&mut state);
            }
            return;
        }
        state.waiting = true;
        drop(state);

        match self.inner.transport.as_ref().and_then(Weak::upgrade) {
            Some(transport) => transport.block_pending(self.serial()),
            None => self.finish(None),
        }
        // the transport completes or expires the call before returning
        if !self.is_finished() {
            self.finish(None);
        }
        self.inner.state.lock().waiting = false;
    }
}

impl Future for PendingCall {
    type Output = Message;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Message> {
        self.inner.waker.register(cx.waker());
        let state = self.inner.state.lock();
        match (&state.status, &state.reply) {
            (CallStatus::Sent, _) => Poll::Pending,
            (_, Some(reply)) => Poll::Ready(reply.clone()),
            (_, None) => Poll::Ready(Message::default()),
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("serial", &self.serial())
            .field("member", &self.inner.sent.member())
            .field("status", &self.status())
            .finish()
    }
}
