//! Signal subscriptions
//!
//! Hooks are indexed by `member:interface`; either half may be empty to
//! subscribe to every member of an interface or to a member on any
//! interface. An incoming signal is looked up under three keys:
//!
//! ```text
//!   "Changed:org.example.I"    exact
//!   "Changed:"                 any interface
//!   ":org.example.I"           any member
//! ```
//!
//! Bus-side match rules are shared between hooks and reference counted by
//! their text. Hooks filtering on a well-known service name make the table
//! watch that name's owner, since signals arrive from the unique name.

use std::collections::HashMap;

use busline_wire::{MatchRule, Message, DBUS_INTERFACE, DBUS_SERVICE};
use tracing::{debug, warn};

use crate::export::{ObjectId, ObjectRef};

/// Bus operations needed while the hook table changes
pub(crate) trait BusRules {
    fn add_match(&self, rule: &str);

    fn remove_match(&self, rule: &str);

    /// Current unique owner of `name`, empty if it has none
    fn name_owner(&self, name: &str) -> String;
}

/// Built-in receivers of bus driver signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalSlot {
    /// `NameAcquired(name)`
    RegisterService,
    /// `NameLost(name)`
    UnregisterService,
    /// `NameOwnerChanged(name, old, new)`
    ServiceOwnerChanged,
}

#[derive(Debug, Clone)]
pub(crate) enum HookTarget {
    /// Declared method `slot` of an exported object
    Object { object: ObjectRef, slot: usize },
    Internal(InternalSlot),
}

impl HookTarget {
    fn same_as(&self, other: &HookTarget) -> bool {
        match (self, other) {
            (
                HookTarget::Object { object, slot },
                HookTarget::Object {
                    object: other_object,
                    slot: other_slot,
                },
            ) => object.id() == other_object.id() && slot == other_slot,
            (HookTarget::Internal(a), HookTarget::Internal(b)) => a == b,
            _ => false,
        }
    }

    fn object_id(&self) -> Option<ObjectId> {
        match self {
            HookTarget::Object { object, .. } => Some(object.id()),
            HookTarget::Internal(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SignalHook {
    pub(crate) service: String,
    pub(crate) path: String,
    /// `None` accepts any arguments; `Some("")` only argument-less signals
    pub(crate) signature: Option<String>,
    pub(crate) arg_match: Vec<Option<String>>,
    pub(crate) target: HookTarget,
    /// Bus-side rule text, also the refcount key
    pub(crate) match_rule: String,
}

impl SignalHook {
    pub(crate) fn new(
        service: &str,
        path: &str,
        interface: &str,
        member: &str,
        arg_match: Vec<Option<String>>,
        signature: Option<String>,
        target: HookTarget,
    ) -> Self {
        let match_rule = MatchRule::new()
            .sender(service)
            .path(path)
            .interface(interface)
            .member(member)
            .args(arg_match.clone())
            .to_string();
        Self {
            service: service.to_string(),
            path: path.to_string(),
            signature,
            arg_match,
            target,
            match_rule,
        }
    }

    fn same_subscription(&self, other: &SignalHook) -> bool {
        self.service == other.service
            && self.path == other.path
            && self.signature == other.signature
            && self.arg_match == other.arg_match
            && self.target.same_as(&other.target)
    }

    fn accepts(&self, msg: &Message, owner: impl Fn(&str) -> String) -> bool {
        if !self.service.is_empty() && owner(&self.service) != msg.sender() {
            return false;
        }
        if !self.path.is_empty() && self.path != msg.path() {
            return false;
        }
        match &self.signature {
            Some(signature) if signature.is_empty() => {
                if !msg.args().is_empty() {
                    return false;
                }
            }
            Some(signature) => {
                if *signature != msg.signature() {
                    return false;
                }
            }
            None => {}
        }
        if self.arg_match.len() > msg.args().len() {
            return false;
        }
        self.arg_match
            .iter()
            .zip(msg.args())
            .all(|(expected, actual)| match expected {
                None => true,
                Some(expected) => actual.as_str() == Some(expected.as_str()),
            })
    }
}

#[derive(Debug, Clone, Default)]
struct WatchedService {
    owner: String,
    refcount: usize,
}

/// Rule watching owner changes of `service`
fn owner_watch_rule(service: &str) -> MatchRule {
    MatchRule::new()
        .sender(DBUS_SERVICE)
        .interface(DBUS_INTERFACE)
        .member("NameOwnerChanged")
        .args(vec![Some(service.to_string())])
}

/// Well-known names are watched; unique names never change owner
fn should_watch(service: &str) -> bool {
    !service.is_empty() && !service.starts_with(':')
}

pub(crate) struct SignalHookTable {
    hooks: HashMap<String, Vec<SignalHook>>,
    rule_refcounts: HashMap<String, usize>,
    watched: HashMap<String, WatchedService>,
}

impl SignalHookTable {
    pub(crate) fn new() -> Self {
        // the driver owns its own name; watching it must not recurse
        let mut watched = HashMap::new();
        watched.insert(
            DBUS_SERVICE.to_string(),
            WatchedService {
                owner: DBUS_SERVICE.to_string(),
                refcount: 1,
            },
        );
        let mut rule_refcounts = HashMap::new();
        rule_refcounts.insert(owner_watch_rule(DBUS_SERVICE).to_string(), 1);
        Self {
            hooks: HashMap::new(),
            rule_refcounts,
            watched,
        }
    }

    pub(crate) fn key(member: &str, interface: &str) -> String {
        format!("{}:{}", member, interface)
    }

    /// Add a hook with no bus-side rule
    pub(crate) fn insert_unmanaged(&mut self, key: String, hook: SignalHook) {
        self.hooks.entry(key).or_default().push(hook);
    }

    /// Add `hook` under `key`. Returns false if an identical subscription
    /// already exists.
    ///
    /// `bus` is `None` on peer connections: hooks are kept locally with no
    /// rule or owner bookkeeping.
    pub(crate) fn connect(&mut self, key: String, hook: SignalHook, bus: Option<&dyn BusRules>) -> bool {
        if self
            .hooks
            .get(&key)
            .map_or(false, |hooks| hooks.iter().any(|h| h.same_subscription(&hook)))
        {
            return false;
        }
        let rule = hook.match_rule.clone();
        let service = hook.service.clone();
        self.hooks.entry(key).or_default().push(hook);

        let Some(bus) = bus else {
            return true;
        };
        let count = self.rule_refcounts.entry(rule.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return true;
        }
        debug!("adding match rule {}", rule);
        bus.add_match(&rule);

        if should_watch(&service) {
            self.watch_service(&service, bus);
        }
        true
    }

    fn watch_service(&mut self, service: &str, bus: &dyn BusRules) {
        let entry = self.watched.entry(service.to_string()).or_default();
        entry.refcount += 1;
        if entry.refcount > 1 {
            return;
        }
        let watcher = SignalHook::new(
            DBUS_SERVICE,
            "",
            DBUS_INTERFACE,
            "NameOwnerChanged",
            vec![Some(service.to_string())],
            None,
            HookTarget::Internal(InternalSlot::ServiceOwnerChanged),
        );
        self.connect(
            Self::key("NameOwnerChanged", DBUS_INTERFACE),
            watcher,
            Some(bus),
        );
        let owner = bus.name_owner(service);
        debug!("watching {} for owner changes (current owner '{}')", service, owner);
        if let Some(entry) = self.watched.get_mut(service) {
            entry.owner = owner;
        }
    }

    fn unwatch_service(&mut self, service: &str, bus: &dyn BusRules) {
        let Some(entry) = self.watched.get_mut(service) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        self.watched.remove(service);
        let watcher = SignalHook::new(
            DBUS_SERVICE,
            "",
            DBUS_INTERFACE,
            "NameOwnerChanged",
            vec![Some(service.to_string())],
            None,
            HookTarget::Internal(InternalSlot::ServiceOwnerChanged),
        );
        self.disconnect(&Self::key("NameOwnerChanged", DBUS_INTERFACE), &watcher, Some(bus));
    }

    /// Remove the subscription equal to `hook`. Returns false if there is
    /// none.
    pub(crate) fn disconnect(&mut self, key: &str, hook: &SignalHook, bus: Option<&dyn BusRules>) -> bool {
        let Some(hooks) = self.hooks.get_mut(key) else {
            return false;
        };
        let Some(index) = hooks.iter().position(|h| h.same_subscription(hook)) else {
            return false;
        };
        let removed = hooks.remove(index);
        if hooks.is_empty() {
            self.hooks.remove(key);
        }
        self.release_rule(&removed, bus);
        true
    }

    fn release_rule(&mut self, hook: &SignalHook, bus: Option<&dyn BusRules>) {
        let Some(bus) = bus else {
            return;
        };
        let Some(count) = self.rule_refcounts.get_mut(&hook.match_rule) else {
            warn!("match rule not found in refcounts: {}", hook.match_rule);
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.rule_refcounts.remove(&hook.match_rule);
        debug!("removing match rule {}", hook.match_rule);
        bus.remove_match(&hook.match_rule);
        if should_watch(&hook.service) {
            self.unwatch_service(&hook.service, bus);
        }
    }

    /// Drop every hook delivering to object `id`
    pub(crate) fn remove_target(&mut self, id: ObjectId, bus: Option<&dyn BusRules>) {
        let mut removed = Vec::new();
        self.hooks.retain(|_, hooks| {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(hooks)
                .into_iter()
                .partition(|h| h.target.object_id() == Some(id));
            removed.extend(gone);
            *hooks = kept;
            !hooks.is_empty()
        });
        for hook in removed {
            self.release_rule(&hook, bus);
        }
    }

    /// Cached owner of a watched name, or the name itself
    pub(crate) fn owner_of(&self, service: &str) -> String {
        match self.watched.get(service) {
            Some(watched) => watched.owner.clone(),
            None => service.to_string(),
        }
    }

    /// Targets of every hook accepting `msg`, in key lookup order
    pub(crate) fn matching(&self, msg: &Message) -> Vec<HookTarget> {
        let member = msg.member();
        let interface = msg.interface();
        let keys = [
            Self::key(member, interface),
            Self::key(member, ""),
            Self::key("", interface),
        ];
        let mut targets = Vec::new();
        for (index, key) in keys.iter().enumerate() {
            // without an interface the first two keys coincide
            if keys[..index].contains(key) {
                continue;
            }
            let Some(hooks) = self.hooks.get(key) else {
                continue;
            };
            targets.extend(
                hooks
                    .iter()
                    .filter(|h| h.accepts(msg, |s| self.owner_of(s)))
                    .map(|h| h.target.clone()),
            );
        }
        targets
    }

    pub(crate) fn service_owner_changed(&mut self, name: &str, old_owner: &str, new_owner: &str) {
        let Some(watched) = self.watched.get_mut(name) else {
            return;
        };
        if watched.owner != old_owner {
            warn!(
                "name '{}' had owner '{}' but it was cached as '{}'",
                name, old_owner, watched.owner
            );
        }
        watched.owner = new_owner.to_string();
    }

    #[cfg(test)]
    pub(crate) fn rule_refcount(&self, rule: &str) -> usize {
        self.rule_refcounts.get(rule).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn hook_count(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }
}
