//! One end of an in-process connection
//!
//! An endpoint is either attached to a [`BusCore`](super::BusCore), which
//! routes its traffic by destination and match rule, or linked directly to
//! a peer endpoint. Replies are matched to tracked calls when they are
//! delivered, on whatever thread delivered them; everything else is queued
//! in the inbox until the engine pops it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::BusCore;
use crate::error::{Result, WireError};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType};
use crate::transport::{
    Capabilities, DispatchStatus, ReplyNotify, Timeout, TimeoutId, Transport, TransportEvents,
};

/// Where an endpoint's outgoing traffic goes
pub(crate) enum Link {
    Bus(Arc<BusCore>),
    Peer(Mutex<Weak<MemoryTransport>>),
}

/// A call waiting for its reply
struct PendingSlot {
    notify: ReplyNotify,
    deadline: Instant,
    timeout: TimeoutId,
}

struct EndpointState {
    connected: bool,
    inbox: VecDeque<Message>,
    pending: HashMap<u32, PendingSlot>,
    next_serial: u32,
    next_timeout: u64,
    rules: Vec<(String, MatchRule)>,
}

/// In-process transport
pub struct MemoryTransport {
    link: Link,
    unique_name: String,
    machine_id: String,
    state: Mutex<EndpointState>,
    completed: Condvar,
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
}

impl MemoryTransport {
    pub(crate) fn new(link: Link, unique_name: String, machine_id: String) -> Self {
        Self {
            link,
            unique_name,
            machine_id,
            state: Mutex::new(EndpointState {
                connected: true,
                inbox: VecDeque::new(),
                pending: HashMap::new(),
                next_serial: 1,
                next_timeout: 1,
                rules: Vec::new(),
            }),
            completed: Condvar::new(),
            events: Mutex::new(None),
        }
    }

    /// Create two endpoints linked to each other
    pub(crate) fn peer_pair(machine_id: &str) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let client = Arc::new(MemoryTransport::new(
            Link::Peer(Mutex::new(Weak::new())),
            String::new(),
            machine_id.to_string(),
        ));
        let server = Arc::new(MemoryTransport::new(
            Link::Peer(Mutex::new(Arc::downgrade(&client))),
            String::new(),
            machine_id.to_string(),
        ));
        if let Link::Peer(other) = &client.link {
            *other.lock() = Arc::downgrade(&server);
        }
        (client, server)
    }

    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        self.events.lock().clone()
    }

    fn next_serial(state: &mut EndpointState) -> u32 {
        let serial = state.next_serial;
        state.next_serial = state.next_serial.wrapping_add(1).max(1);
        serial
    }

    fn route(&self, msg: Message) -> Result<()> {
        match &self.link {
            Link::Bus(core) => core.route(self, msg),
            Link::Peer(other) => {
                let peer = other.lock().upgrade().ok_or(WireError::Disconnected)?;
                peer.deliver(msg);
                Ok(())
            }
        }
    }

    /// Accept a message addressed to this endpoint
    pub(crate) fn deliver(&self, msg: Message) {
        let is_reply = matches!(msg.kind(), MessageType::MethodReturn | MessageType::Error);
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            if is_reply && state.pending.contains_key(&msg.reply_serial()) {
                drop(state);
                self.finish(msg.reply_serial(), Some(msg));
                return;
            }
            if is_reply {
                trace!("dropping unmatched reply to serial {}", msg.reply_serial());
                return;
            }
            state.inbox.push_back(msg);
        }
        if let Some(events) = self.events() {
            events.dispatch_status_changed(DispatchStatus::DataRemains);
        }
    }

    /// Complete a tracked call. Only the first completion has any effect.
    fn finish(&self, serial: u32, reply: Option<Message>) {
        let slot = self.state.lock().pending.remove(&serial);
        if let Some(slot) = slot {
            if let Some(events) = self.events() {
                events.remove_timeout(slot.timeout);
            }
            (slot.notify)(reply);
        }
        self.completed.notify_all();
    }

    /// Check this endpoint's match rules against a broadcast signal
    pub(crate) fn wants<F>(&self, msg: &Message, owner_of: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        let state = self.state.lock();
        state.connected && state.rules.iter().any(|(_, rule)| rule.matches(msg, &owner_of))
    }

    /// The remote side of a peer link went away
    pub(crate) fn peer_gone(&self) {
        if self.shut_down() {
            if let Some(events) = self.events() {
                events.disconnected();
            }
        }
    }

    /// Mark disconnected and fail every tracked call. Returns false if
    /// already disconnected.
    fn shut_down(&self) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if !state.connected {
                return false;
            }
            state.connected = false;
            state.inbox.clear();
            state.rules.clear();
            std::mem::take(&mut state.pending)
        };
        let events = self.events();
        for (serial, slot) in pending {
            debug!("failing call {} on disconnect", serial);
            if let Some(events) = &events {
                events.remove_timeout(slot.timeout);
            }
            (slot.notify)(None);
        }
        self.completed.notify_all();
        true
    }
}

impl Transport for MemoryTransport {
    fn unique_name(&self) -> String {
        self.unique_name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::UNIX_FD_PASSING
    }

    fn machine_id(&self) -> String {
        self.machine_id.clone()
    }

    fn set_events(&self, events: Arc<dyn TransportEvents>) {
        *self.events.lock() = Some(events.clone());
        if !self.state.lock().inbox.is_empty() {
            events.dispatch_status_changed(DispatchStatus::DataRemains);
        }
    }

    fn send(&self, mut msg: Message) -> Result<u32> {
        let serial = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(WireError::Disconnected);
            }
            Self::next_serial(&mut state)
        };
        msg.set_serial(serial);
        msg.set_sender(self.unique_name.clone());
        self.route(msg)?;
        Ok(serial)
    }

    fn send_with_reply(&self, mut msg: Message, timeout: Duration, notify: ReplyNotify) -> Result<u32> {
        let (serial, timeout_id) = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(WireError::Disconnected);
            }
            let serial = Self::next_serial(&mut state);
            let timeout_id = TimeoutId(state.next_timeout);
            state.next_timeout += 1;
            state.pending.insert(
                serial,
                PendingSlot {
                    notify,
                    deadline: Instant::now() + timeout,
                    timeout: timeout_id,
                },
            );
            (serial, timeout_id)
        };

        if let Some(events) = self.events() {
            events.add_timeout(Timeout {
                id: timeout_id,
                interval: timeout,
                enabled: true,
            });
        }

        msg.set_serial(serial);
        msg.set_sender(self.unique_name.clone());
        if let Err(err) = self.route(msg) {
            // the call never left; its notification is dropped unused
            let slot = self.state.lock().pending.remove(&serial);
            if let (Some(slot), Some(events)) = (slot, self.events()) {
                events.remove_timeout(slot.timeout);
            }
            return Err(err);
        }
        Ok(serial)
    }

    fn block_pending(&self, serial: u32) {
        let mut state = self.state.lock();
        loop {
            let Some(deadline) = state.pending.get(&serial).map(|slot| slot.deadline) else {
                return;
            };
            if Instant::now() >= deadline {
                drop(state);
                self.finish(serial, None);
                return;
            }
            self.completed.wait_until(&mut state, deadline);
        }
    }

    fn send_with_reply_and_block(&self, msg: Message, timeout: Duration) -> Result<Message> {
        let (sink, result) = crossbeam_channel::bounded::<Option<Message>>(1);
        let serial = self.send_with_reply(
            msg,
            timeout,
            Box::new(move |reply| {
                let _ = sink.send(reply);
            }),
        )?;
        self.block_pending(serial);

        // the notification may still be running on the delivering thread
        match result.recv().ok().flatten() {
            Some(reply) => Ok(reply),
            None if self.is_connected() => Err(WireError::Timeout),
            None => Err(WireError::Disconnected),
        }
    }

    fn pop_message(&self) -> Option<Message> {
        self.state.lock().inbox.pop_front()
    }

    fn add_match(&self, rule: &str) -> Result<()> {
        if matches!(self.link, Link::Peer(_)) {
            return Ok(());
        }
        let parsed = MatchRule::parse(rule)?;
        let mut state = self.state.lock();
        if !state.connected {
            return Err(WireError::Disconnected);
        }
        state.rules.push((rule.to_string(), parsed));
        Ok(())
    }

    fn remove_match(&self, rule: &str) -> Result<()> {
        if matches!(self.link, Link::Peer(_)) {
            return Ok(());
        }
        let mut state = self.state.lock();
        match state.rules.iter().position(|(text, _)| text == rule) {
            Some(index) => {
                state.rules.remove(index);
                Ok(())
            }
            None => Err(WireError::MatchRuleNotFound(rule.to_string())),
        }
    }

    fn handle_timeout(&self, id: TimeoutId) {
        let serial = self
            .state
            .lock()
            .pending
            .iter()
            .find(|(_, slot)| slot.timeout == id)
            .map(|(serial, _)| *serial);
        if let Some(serial) = serial {
            debug!("call {} timed out", serial);
            self.finish(serial, None);
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn close(&self) {
        if !self.shut_down() {
            return;
        }
        match &self.link {
            Link::Bus(core) => core.disconnect(&self.unique_name),
            Link::Peer(other) => {
                if let Some(peer) = other.lock().upgrade() {
                    peer.peer_gone();
                }
            }
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_pair_delivery() {
        let (client, server) = MemoryTransport::peer_pair("id");
        let serial = client
            .send(Message::method_call("", "/", "a.b", "M"))
            .unwrap();
        let received = server.pop_message().unwrap();
        assert_eq!(received.serial(), serial);
        assert_eq!(received.member(), "M");
        assert!(server.pop_message().is_none());
    }

    #[test]
    fn test_reply_completes_pending() {
        let (client, server) = MemoryTransport::peer_pair("id");
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        client
            .send_with_reply(
                Message::method_call("", "/", "a.b", "M"),
                Duration::from_secs(5),
                Box::new(move |reply| *sink.lock() = Some(reply)),
            )
            .unwrap();

        let call = server.pop_message().unwrap();
        server.send(call.create_reply(vec!["ok".into()])).unwrap();

        let reply = got.lock().take().unwrap().unwrap();
        assert_eq!(reply.args()[0].as_str(), Some("ok"));
        assert!(client.pop_message().is_none());
    }

    #[test]
    fn test_block_pending_expires() {
        let (client, _server) = MemoryTransport::peer_pair("id");
        let err = client
            .send_with_reply_and_block(
                Message::method_call("", "/", "a.b", "M"),
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert_eq!(err, WireError::Timeout);
    }

    #[test]
    fn test_blocking_call_answered_from_another_thread() {
        let (client, server) = MemoryTransport::peer_pair("id");
        let answering = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if let Some(call) = server.pop_message() {
                    server.send(call.create_reply(vec!["late".into()])).unwrap();
                    return;
                }
                assert!(Instant::now() < deadline, "call never arrived");
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        let reply = client
            .send_with_reply_and_block(Message::method_call("", "/", "a.b", "M"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply.args()[0].as_str(), Some("late"));
        answering.join().unwrap();
    }

    #[test]
    fn test_blocking_call_fails_on_disconnect() {
        let (client, server) = MemoryTransport::peer_pair("id");
        let closing = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            server.close();
        });
        let err = client
            .send_with_reply_and_block(Message::method_call("", "/", "a.b", "M"), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, WireError::Disconnected);
        closing.join().unwrap();
    }

    #[test]
    fn test_close_fails_pending() {
        let (client, server) = MemoryTransport::peer_pair("id");
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        client
            .send_with_reply(
                Message::method_call("", "/", "a.b", "M"),
                Duration::from_secs(5),
                Box::new(move |reply| *sink.lock() = Some(reply)),
            )
            .unwrap();
        server.close();
        assert_eq!(*got.lock(), Some(None));
        assert!(!client.is_connected());
        assert!(client.send(Message::signal("/", "a.b", "S")).is_err());
    }
}
