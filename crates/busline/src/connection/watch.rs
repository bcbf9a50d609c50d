//! Transport watches, timeouts and the dispatch pump
//!
//! Transports may report watches and timeouts from any thread. Timeouts
//! become one-shot timers on the connection's home queue; a request from a
//! foreign thread is queued and armed by a task posted home.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use busline_wire::{
    BusError, DispatchStatus, ErrorType, Timeout, TimeoutId, TransportEvents, Watch, WatchFlags,
    WatchId,
};
use tracing::{debug, trace};

use super::Connection;
use crate::context::IncomingCall;
use crate::error::texts;
use crate::event_loop::TimerId;

#[derive(Default)]
pub(super) struct WatchTable {
    watches: HashMap<WatchId, Watch>,
    timers: HashMap<TimeoutId, TimerId>,
    /// Timeouts reported off the home thread, waiting to be armed
    queued_timeouts: Vec<Timeout>,
}

/// The connection side of [`TransportEvents`]
pub(super) struct ConnectionEvents {
    connection: Weak<Connection>,
}

impl ConnectionEvents {
    pub(super) fn new(connection: &Arc<Connection>) -> Self {
        Self {
            connection: Arc::downgrade(connection),
        }
    }
}

impl TransportEvents for ConnectionEvents {
    fn add_watch(&self, watch: Watch) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        trace!("'{}' watching fd {} ({:?})", connection.name, watch.fd, watch.flags);
        let guard = connection.watches.lock();
        guard.borrow_mut().watches.insert(watch.id, watch);
        true
    }

    fn remove_watch(&self, id: WatchId) {
        if let Some(connection) = self.connection.upgrade() {
            let guard = connection.watches.lock();
            guard.borrow_mut().watches.remove(&id);
        }
    }

    fn toggle_watch(&self, id: WatchId, enabled: bool) {
        if let Some(connection) = self.connection.upgrade() {
            let guard = connection.watches.lock();
            let mut table = guard.borrow_mut();
            if let Some(watch) = table.watches.get_mut(&id) {
                watch.enabled = enabled;
            }
        }
    }

    fn add_timeout(&self, timeout: Timeout) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        if !timeout.enabled {
            return true;
        }
        if connection.home.is_current() {
            return connection.arm_timeout(timeout);
        }
        {
            let guard = connection.watches.lock();
            guard.borrow_mut().queued_timeouts.push(timeout);
        }
        let weak = self.connection.clone();
        connection.home.post(Box::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.flush_queued_timeouts();
            }
        }))
    }

    fn remove_timeout(&self, id: TimeoutId) {
        if let Some(connection) = self.connection.upgrade() {
            connection.disarm_timeout(id);
        }
    }

    fn dispatch_status_changed(&self, status: DispatchStatus) {
        if status == DispatchStatus::DataRemains {
            if let Some(connection) = self.connection.upgrade() {
                connection.schedule_dispatch();
            }
        }
    }

    fn disconnected(&self) {
        if let Some(connection) = self.connection.upgrade() {
            debug!("'{}' lost its transport", connection.name);
            connection.set_last_error(Some(BusError::new(
                ErrorType::Disconnected,
                texts::NOT_CONNECTED_TO_BUS,
            )));
            connection.close_connection();
            connection.release_accepted();
        }
    }
}

impl Connection {
    /// Arm `timeout` as a timer on the home queue. Home thread only.
    fn arm_timeout(self: &Arc<Self>, timeout: Timeout) -> bool {
        let weak = Arc::downgrade(self);
        let id = timeout.id;
        let timer = self.home.post_delayed(
            timeout.interval,
            Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.fire_timeout(id);
                }
            }),
        );
        let Some(timer) = timer else {
            return false;
        };
        let guard = self.watches.lock();
        let replaced = guard.borrow_mut().timers.insert(id, timer);
        if let Some(old) = replaced {
            self.home.cancel_timer(old);
        }
        true
    }

    fn flush_queued_timeouts(self: &Arc<Self>) {
        let queued = {
            let guard = self.watches.lock();
            let mut table = guard.borrow_mut();
            std::mem::take(&mut table.queued_timeouts)
        };
        for timeout in queued {
            self.arm_timeout(timeout);
        }
    }

    fn disarm_timeout(&self, id: TimeoutId) {
        let guard = self.watches.lock();
        let mut table = guard.borrow_mut();
        table.queued_timeouts.retain(|t| t.id != id);
        if let Some(timer) = table.timers.remove(&id) {
            self.home.cancel_timer(timer);
        }
    }

    fn fire_timeout(self: &Arc<Self>, id: TimeoutId) {
        let armed = {
            let guard = self.watches.lock();
            let removed = guard.borrow_mut().timers.remove(&id);
            removed.is_some()
        };
        if !armed {
            return;
        }
        if let Some(transport) = self.transport() {
            trace!("'{}' timeout {:?} fired", self.name, id);
            transport.handle_timeout(id);
        }
        self.do_dispatch();
    }

    /// Drop every watch and cancel every timer
    pub(super) fn clear_watches(&self) {
        let guard = self.watches.lock();
        let mut table = guard.borrow_mut();
        table.watches.clear();
        table.queued_timeouts.clear();
        for (_, timer) in table.timers.drain() {
            self.home.cancel_timer(timer);
        }
    }

    /// Post one dispatch pass to the home queue unless one is pending
    pub(super) fn schedule_dispatch(&self) {
        if self.dispatch_posted.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.self_ref.clone();
        let posted = self.home.post(Box::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.do_dispatch();
            }
        }));
        if !posted {
            self.dispatch_posted.store(false, Ordering::SeqCst);
        }
    }

    /// Route every queued incoming message, in arrival order
    pub(super) fn do_dispatch(self: &Arc<Self>) {
        self.dispatch_posted.store(false, Ordering::SeqCst);
        while let Some(transport) = self.transport() {
            let Some(msg) = transport.pop_message() else {
                break;
            };
            self.handle_message(IncomingCall::remote(msg));
        }
    }

    /// Readiness reported by an external poller for `fd`
    pub(crate) fn socket_ready(self: &Arc<Self>, fd: i32, readiness: WatchFlags) {
        if !self.home.is_current() {
            let weak = Arc::downgrade(self);
            self.home.post(Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.socket_ready(fd, readiness);
                }
            }));
            return;
        }
        let ready: Vec<WatchId> = {
            let guard = self.watches.lock();
            let table = guard.borrow();
            table
                .watches
                .values()
                .filter(|w| w.fd == fd && w.enabled && w.flags.intersects(readiness))
                .map(|w| w.id)
                .collect()
        };
        if let Some(transport) = self.transport() {
            for id in ready {
                transport.handle_watch(id, readiness);
            }
        }
        self.do_dispatch();
    }

    pub(crate) fn watches(&self) -> Vec<Watch> {
        let guard = self.watches.lock();
        let table = guard.borrow();
        let mut watches: Vec<Watch> = table.watches.values().copied().collect();
        watches.sort_by_key(|w| w.id);
        watches
    }

    #[cfg(test)]
    pub(crate) fn armed_timeouts(&self) -> usize {
        let guard = self.watches.lock();
        let table = guard.borrow();
        table.timers.len()
    }
}
