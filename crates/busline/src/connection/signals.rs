//! Signal subscriptions on a connection

use busline_wire::names::{is_valid_bus_name, is_valid_interface_name, is_valid_member_name, is_valid_object_path};
use busline_wire::signature::starts_with_types;
use tracing::{debug, warn};

use super::Connection;
use crate::export::{ObjectKind, ObjectRef};
use crate::signal_hooks::{BusRules, HookTarget, SignalHook, SignalHookTable};

/// Which signals a subscription receives. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMatch {
    pub service: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Required string arguments by position; `None` skips a position
    pub args: Vec<Option<String>>,
    /// Required argument signature; `None` accepts any
    pub signature: Option<String>,
}

impl SignalMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn args(mut self, args: Vec<Option<String>>) -> Self {
        self.args = args;
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    fn is_valid(&self) -> bool {
        if self.interface.is_empty() && self.member.is_empty() {
            return false;
        }
        (self.service.is_empty() || is_valid_bus_name(&self.service))
            && (self.path.is_empty() || is_valid_object_path(&self.path))
            && (self.interface.is_empty() || is_valid_interface_name(&self.interface))
            && (self.member.is_empty() || is_valid_member_name(&self.member))
    }
}

impl Connection {
    /// Build the hook for `filter` delivering to `slot` of `target`
    fn prepare_hook(&self, filter: &SignalMatch, target: &ObjectRef, slot: &str) -> Option<(String, SignalHook)> {
        if !filter.is_valid() {
            debug!("rejecting signal match {:?}", filter);
            return None;
        }
        if !matches!(target.kind(), ObjectKind::Exported(_)) {
            return None;
        }
        let Some(index) = target.slots().by_name(slot) else {
            warn!("{} has no method '{}' to receive signals", target.id(), slot);
            return None;
        };
        let method = target.slots().get(index);
        if let Some(signature) = &filter.signature {
            if !method.takes_message && !starts_with_types(signature, &method.input) {
                warn!(
                    "'{}' takes '{}', which does not fit signal signature '{}'",
                    slot, method.input, signature
                );
                return None;
            }
        }
        let hook = SignalHook::new(
            &filter.service,
            &filter.path,
            &filter.interface,
            &filter.member,
            filter.args.clone(),
            filter.signature.clone(),
            HookTarget::Object {
                object: target.clone(),
                slot: index,
            },
        );
        Some((SignalHookTable::key(&filter.member, &filter.interface), hook))
    }

    pub(crate) fn connect_signal(&self, filter: &SignalMatch, target: &ObjectRef, slot: &str) -> bool {
        let Some((key, hook)) = self.prepare_hook(filter, target, slot) else {
            return false;
        };
        let rules = self.bus_rules();
        let added = self
            .state
            .write()
            .hooks
            .connect(key, hook, rules.as_ref().map(|r| r as &dyn BusRules));
        if !added {
            debug!("{} already receives {:?}", target.id(), filter);
        }
        target.add_listener(self.listener_ref());
        true
    }

    pub(crate) fn disconnect_signal(&self, filter: &SignalMatch, target: &ObjectRef, slot: &str) -> bool {
        let Some((key, hook)) = self.prepare_hook(filter, target, slot) else {
            return false;
        };
        let rules = self.bus_rules();
        self.state
            .write()
            .hooks
            .disconnect(&key, &hook, rules.as_ref().map(|r| r as &dyn BusRules))
    }
}
