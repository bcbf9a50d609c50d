//! Routing of incoming messages to exported objects and signal hooks

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use busline_wire::signature::starts_with_types;
use busline_wire::{ErrorType, Message, MessageType, Value};
use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use super::Connection;
use crate::context::{CallContext, IncomingCall, SenderGuard};
use crate::error::{texts, MethodError};
use crate::export::{ObjectKind, ObjectRef, RegisterOptions};
use crate::object_tree::NodeSnapshot;
use crate::signal_hooks::{HookTarget, InternalSlot};

/// Object activation deferred to the object's home queue.
///
/// If the task is dropped without running (the home is gone, or the
/// object was destroyed first) the caller gets `UnknownObject`.
struct ActivationTask {
    connection: Weak<Connection>,
    call: IncomingCall,
    node: NodeSnapshot,
    path_start: usize,
    /// Released once the task ran or was dropped
    done: Option<Sender<()>>,
    handled: bool,
}

impl ActivationTask {
    fn run(mut self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let destroyed = self.node.handler.as_ref().map_or(false, ObjectRef::is_destroyed);
        if !destroyed {
            connection.activate_object(&self.node, &self.call, self.path_start);
            self.handled = true;
        }
    }
}

impl Drop for ActivationTask {
    fn drop(&mut self) {
        if !self.handled {
            if let Some(connection) = self.connection.upgrade() {
                let path = self.call.message().path().to_string();
                connection.send_error(&self.call, ErrorType::UnknownObject, texts::no_such_object(&path));
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Connection {
    /// Route one message. Returns false if it could not be dispatched.
    pub(crate) fn handle_message(self: &Arc<Self>, call: IncomingCall) -> bool {
        if !self.is_connected() {
            return false;
        }
        if let Some(registry) = self.registry() {
            registry.run_spy_hooks(call.message());
        }
        let msg = call.message();
        trace!(
            "'{}' handling {:?} {} {}.{}",
            self.name,
            msg.kind(),
            msg.path(),
            msg.interface(),
            msg.member()
        );
        match msg.kind() {
            MessageType::Signal => {
                self.handle_signal(msg);
                true
            }
            MessageType::MethodCall => {
                self.handle_object_call(call);
                true
            }
            // replies are routed by the transport to their pending call
            MessageType::MethodReturn | MessageType::Error | MessageType::Invalid => false,
        }
    }

    pub(super) fn handle_signal(self: &Arc<Self>, msg: &Message) {
        let targets = self.state.read().hooks.matching(msg);
        for target in targets {
            match target {
                HookTarget::Internal(slot) => self.run_internal_slot(slot, msg),
                HookTarget::Object { object, slot } => {
                    if object.home().is_current() {
                        self.invoke_slot(&object, slot, msg);
                    } else {
                        self.post_slot_call(object, slot, msg.clone());
                    }
                }
            }
        }
    }

    fn run_internal_slot(&self, slot: InternalSlot, msg: &Message) {
        let arg = |index: usize| {
            msg.args()
                .get(index)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match slot {
            InternalSlot::RegisterService => {
                let name = arg(0);
                debug!("'{}' acquired {}", self.name, name);
                self.record_service(&name);
            }
            InternalSlot::UnregisterService => {
                let name = arg(0);
                debug!("'{}' lost {}", self.name, name);
                self.forget_service(&name);
            }
            InternalSlot::ServiceOwnerChanged => {
                let (name, old_owner, new_owner) = (arg(0), arg(1), arg(2));
                self.state
                    .write()
                    .hooks
                    .service_owner_changed(&name, &old_owner, &new_owner);
            }
        }
    }

    /// Find the object answering for the call's path and activate it on
    /// its home queue
    pub(crate) fn handle_object_call(self: &Arc<Self>, call: IncomingCall) {
        let path = call.message().path().to_string();
        let found = self.state.read().tree.find(&path);
        let Some((node, path_start)) = found else {
            debug!("'{}' has no object at {}", self.name, path);
            self.send_error(&call, ErrorType::UnknownObject, texts::no_such_object(&path));
            return;
        };

        let Some(handler) = node.handler.clone() else {
            // intermediate node: only the built-in interfaces answer
            self.activate_object(&node, &call, path_start);
            return;
        };

        let home = handler.home().clone();
        if !home.is_alive() {
            self.send_error(
                &call,
                ErrorType::InternalError,
                texts::object_has_no_thread(handler.name(), &path),
            );
            return;
        }

        if call.is_local() && home.is_current() {
            self.activate_object(&node, &call, path_start);
            return;
        }

        let (done, finished) = call.is_local().then(|| crossbeam_channel::bounded::<()>(1)).unzip();
        let task = ActivationTask {
            connection: Arc::downgrade(self),
            call,
            node,
            path_start,
            done,
            handled: false,
        };
        home.post(Box::new(move || task.run()));
        if let Some(finished) = finished {
            // a disconnect also means the task is gone
            let _ = finished.recv();
        }
    }

    /// Deliver a call to the node's handler, trying each export in turn
    pub(super) fn activate_object(self: &Arc<Self>, node: &NodeSnapshot, call: &IncomingCall, path_start: usize) {
        let msg = call.message();
        let path = msg.path();

        let Some(handler) = node.handler.clone() else {
            if !self.activate_internal_filters(node, None, call) {
                self.send_unknown_method_or_interface(call);
            }
            return;
        };

        if let ObjectKind::Virtual(object) = handler.kind() {
            let ctx = CallContext::new(self, call);
            let handled = {
                let _sender = SenderGuard::enter(self);
                catch_unwind(AssertUnwindSafe(|| object.handle_message(&ctx)))
            };
            match handled {
                Ok(true) => return,
                Ok(false) => {}
                Err(_) => {
                    warn!("virtual object at {} panicked handling {}", path, msg.member());
                    self.send_error(call, ErrorType::InternalError, texts::DELIVERY_FAILED.to_string());
                    return;
                }
            }
            if !self.activate_internal_filters(node, Some(&handler), call) {
                self.send_unknown_method_or_interface(call);
            }
            return;
        }

        let mut flags = node.flags;
        let mut object = handler;
        if path_start < path.len() {
            // flattened child: resolve the rest of the path by name
            flags -= RegisterOptions::EXPORT_ALL_SIGNALS;
            for segment in path[path_start..].split('/').filter(|s| !s.is_empty()) {
                match object.child(segment) {
                    Some(child) => object = child,
                    None => {
                        self.send_error(call, ErrorType::UnknownObject, texts::no_such_object(path));
                        return;
                    }
                }
            }
        }

        let interface = msg.interface();
        if flags.contains(RegisterOptions::EXPORT_ADAPTORS) {
            let adaptor_flags = flags | RegisterOptions::EXPORT_ALL_SLOTS;
            if interface.is_empty() {
                for adaptor in object.adaptors() {
                    if self.activate_call(adaptor, adaptor_flags, call) {
                        return;
                    }
                }
            } else if let Some(adaptor) = object.adaptor(interface) {
                if !self.activate_call(adaptor, adaptor_flags, call) {
                    self.send_unknown_method(call);
                }
                return;
            }
        }

        let resolved = NodeSnapshot {
            handler: Some(object.clone()),
            flags,
            children: node.children.clone(),
        };
        if self.activate_internal_filters(&resolved, Some(&object), call) {
            return;
        }

        let method_flags = RegisterOptions::EXPORT_ALL_SLOTS | RegisterOptions::EXPORT_ALL_INVOKABLES;
        if flags.intersects(method_flags) && (interface.is_empty() || interface == object.interface()) {
            if !self.activate_call(&object, flags, call) {
                self.send_unknown_method(call);
            }
            return;
        }

        self.send_unknown_method_or_interface(call);
    }

    /// Call the method matching the message, if `object` exports one
    pub(super) fn activate_call(self: &Arc<Self>, object: &ObjectRef, flags: RegisterOptions, call: &IncomingCall) -> bool {
        let msg = call.message();
        match object.slots().find(msg.member(), &msg.signature(), flags) {
            Some(slot) => {
                self.deliver_call(object, slot, call);
                true
            }
            None => false,
        }
    }

    /// Run a declared method and answer with its outcome, unless the
    /// handler answered or delayed the reply itself
    pub(super) fn deliver_call(self: &Arc<Self>, object: &ObjectRef, slot: usize, call: &IncomingCall) {
        let ObjectKind::Exported(exported) = object.kind() else {
            return;
        };
        let method = &object.slots().get(slot).name;
        let msg = call.message();
        let ctx = CallContext::new(self, call);
        let outcome = {
            let _sender = SenderGuard::enter(self);
            catch_unwind(AssertUnwindSafe(|| exported.invoke(method, &ctx)))
        };

        let reply = match outcome {
            Ok(Ok(values)) => msg.create_reply(values),
            Ok(Err(MethodError::Dbus(error))) => msg.create_error_reply(&error),
            Ok(Err(MethodError::Failed(text))) => {
                warn!("{}.{} at {} failed: {}", object.interface(), method, msg.path(), text);
                msg.create_error_reply_of(ErrorType::InternalError, text)
            }
            Err(_) => {
                warn!("{}.{} at {} panicked", object.interface(), method, msg.path());
                msg.create_error_reply_of(ErrorType::InternalError, texts::DELIVERY_FAILED)
            }
        };
        let wanted = msg.is_reply_required() || call.is_local();
        if !wanted || ctx.responded() || ctx.is_delayed() {
            return;
        }
        self.send_reply_to(call, reply);
    }

    /// Hand a signal or reply to a declared method; its result is dropped
    pub(crate) fn invoke_slot(self: &Arc<Self>, object: &ObjectRef, slot: usize, msg: &Message) {
        let ObjectKind::Exported(exported) = object.kind() else {
            return;
        };
        let method = object.slots().get(slot);
        if !method.takes_message && !starts_with_types(&msg.signature(), &method.input) {
            debug!(
                "dropping {} for {}: signature '{}' does not fit '{}'",
                msg.member(),
                method.name,
                msg.signature(),
                method.input
            );
            return;
        }
        let call = IncomingCall::remote(msg.clone());
        let ctx = CallContext::new(self, &call);
        let _sender = SenderGuard::enter(self);
        match catch_unwind(AssertUnwindSafe(|| exported.invoke(&method.name, &ctx))) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!("{} handling {} failed: {}", method.name, msg.member(), err),
            Err(_) => warn!("{} panicked handling {}", method.name, msg.member()),
        }
    }

    /// Queue `invoke_slot` on the object's home
    pub(crate) fn post_slot_call(self: &Arc<Self>, object: ObjectRef, slot: usize, msg: Message) {
        let connection = Arc::downgrade(self);
        let home = object.home().clone();
        let posted = home.post(Box::new(move || {
            if object.is_destroyed() {
                return;
            }
            if let Some(connection) = connection.upgrade() {
                connection.invoke_slot(&object, slot, &msg);
            }
        }));
        if !posted {
            debug!("home of a slot target is gone, dropping delivery");
        }
    }

    pub(super) fn send_unknown_method(&self, call: &IncomingCall) {
        let msg = call.message();
        let text = texts::no_such_method(msg.member(), msg.interface(), msg.path(), &msg.signature());
        self.send_error(call, ErrorType::UnknownMethod, text);
    }

    fn send_unknown_method_or_interface(&self, call: &IncomingCall) {
        let msg = call.message();
        if msg.interface().is_empty() {
            self.send_unknown_method(call);
        } else {
            let text = texts::no_such_interface(msg.interface(), msg.path());
            self.send_error(call, ErrorType::UnknownInterface, text);
        }
    }
}
