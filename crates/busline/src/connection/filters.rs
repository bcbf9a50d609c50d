//! Built-in `Introspectable` and `Properties` interfaces

use std::sync::Arc;

use busline_wire::{ErrorType, Message, Value};
use tracing::debug;

use super::Connection;
use crate::context::IncomingCall;
use crate::error::MethodError;
use crate::export::{ObjectKind, ObjectRef, PropertyDescriptor, RegisterOptions};
use crate::introspect::{introspect_node, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE};
use crate::object_tree::NodeSnapshot;

fn interface_not_found(msg: &Message, interface: &str) -> Message {
    msg.create_error_reply_of(
        ErrorType::UnknownInterface,
        format!("Interface {} was not found in object {}", interface, msg.path()),
    )
}

fn qualified(interface: &str, property: &str) -> String {
    if interface.is_empty() {
        property.to_string()
    } else {
        format!("{}.{}", interface, property)
    }
}

fn property_not_found(msg: &Message, interface: &str, property: &str) -> Message {
    msg.create_error_reply_of(
        ErrorType::UnknownProperty,
        format!(
            "Property {} was not found in object {}",
            qualified(interface, property),
            msg.path()
        ),
    )
}

fn string_arg(msg: &Message, index: usize) -> &str {
    msg.args().get(index).and_then(Value::as_str).unwrap_or_default()
}

/// Outcome of looking a property up in one object or adaptor
enum Lookup<'a> {
    /// The object does not export the interface
    NoInterface,
    NoProperty,
    Found(&'a ObjectRef, &'a PropertyDescriptor),
}

/// Where properties of a call may live
struct PropertyScope<'a> {
    object: &'a ObjectRef,
    flags: RegisterOptions,
}

impl<'a> PropertyScope<'a> {
    fn object_exports_properties(&self) -> bool {
        self.flags.intersects(RegisterOptions::EXPORT_ALL_PROPERTIES)
    }

    fn exported_by_object(&self, property: &PropertyDescriptor) -> bool {
        self.flags.contains(property.export_flag())
    }

    /// Adaptors come first; the object's own properties are searched when
    /// no adaptor claimed the interface
    fn lookup(&self, interface: &str, name: &str) -> Lookup<'a> {
        let object = self.object;
        let mut interface_found = interface.is_empty();
        if self.flags.contains(RegisterOptions::EXPORT_ADAPTORS) {
            if interface.is_empty() {
                for adaptor in object.adaptors() {
                    if let Some(property) = adaptor.property_descriptor(name) {
                        return Lookup::Found(adaptor, property);
                    }
                }
            } else if let Some(adaptor) = object.adaptor(interface) {
                return match adaptor.property_descriptor(name) {
                    Some(property) => Lookup::Found(adaptor, property),
                    None => Lookup::NoProperty,
                };
            }
        }
        if self.object_exports_properties() {
            if !interface.is_empty() && interface == object.interface() {
                interface_found = true;
            }
            if interface_found {
                if let Some(property) = object.property_descriptor(name) {
                    if self.exported_by_object(property) {
                        return Lookup::Found(object, property);
                    }
                }
            }
        }
        if interface_found {
            Lookup::NoProperty
        } else {
            Lookup::NoInterface
        }
    }

    /// Readable properties of `interface`, or of everything when empty.
    /// `None` if the interface is not exported.
    fn readable(&self, interface: &str) -> Option<Vec<(&'a ObjectRef, &'a PropertyDescriptor)>> {
        let object = self.object;
        let mut found = interface.is_empty();
        let mut properties = Vec::new();
        if self.flags.contains(RegisterOptions::EXPORT_ADAPTORS) {
            for adaptor in object.adaptors() {
                if interface.is_empty() || adaptor.interface() == interface {
                    found = true;
                    properties.extend(adaptor.properties().iter().map(|p| (adaptor, p)));
                }
            }
        }
        let own = interface.is_empty() || (!found && interface == object.interface());
        if self.object_exports_properties() && own {
            found = true;
            properties.extend(
                object
                    .properties()
                    .iter()
                    .filter(|p| self.exported_by_object(p))
                    .map(|p| (object, p)),
            );
        }
        found.then(|| {
            properties
                .into_iter()
                .filter(|(_, p)| p.access.readable())
                .collect()
        })
    }
}

fn read(object: &ObjectRef, name: &str) -> Option<Value> {
    match object.kind() {
        ObjectKind::Exported(exported) => exported.property(name),
        ObjectKind::Virtual(_) => None,
    }
}

impl Connection {
    /// Answer calls to the built-in interfaces. Returns false if the call
    /// is not addressed to one of them.
    pub(super) fn activate_internal_filters(
        self: &Arc<Self>,
        node: &NodeSnapshot,
        object: Option<&ObjectRef>,
        call: &IncomingCall,
    ) -> bool {
        let msg = call.message();
        let interface = msg.interface();

        if interface.is_empty() || interface == INTROSPECTABLE_INTERFACE {
            if msg.member() == "Introspect" && msg.signature().is_empty() {
                let xml = introspect_node(msg.path(), object, node.flags, &node.children);
                self.send_reply_to(call, msg.create_reply(vec![xml.into()]));
                return true;
            }
            if !interface.is_empty() {
                self.send_unknown_method(call);
                return true;
            }
        }

        let Some(object) = object else {
            return false;
        };
        if interface.is_empty() || interface == PROPERTIES_INTERFACE {
            let scope = PropertyScope {
                object,
                flags: node.flags,
            };
            let reply = match (msg.member(), msg.signature().as_str()) {
                ("Get", "ss") => Some(self.property_get(&scope, msg)),
                ("Set", "ssv") => Some(self.property_set(&scope, msg)),
                ("GetAll", "s") => Some(self.property_get_all(&scope, msg)),
                _ => None,
            };
            match reply {
                Some(reply) => {
                    self.send_reply_to(call, reply);
                    return true;
                }
                None if !interface.is_empty() => {
                    self.send_unknown_method(call);
                    return true;
                }
                None => {}
            }
        }
        false
    }

    fn property_get(&self, scope: &PropertyScope<'_>, msg: &Message) -> Message {
        let (interface, name) = (string_arg(msg, 0), string_arg(msg, 1));
        let value = match scope.lookup(interface, name) {
            Lookup::NoInterface => return interface_not_found(msg, interface),
            Lookup::NoProperty => None,
            Lookup::Found(owner, property) if property.access.readable() => read(owner, name),
            Lookup::Found(..) => None,
        };
        match value {
            Some(value) => msg.create_reply(vec![Value::variant(value)]),
            None => property_not_found(msg, interface, name),
        }
    }

    fn property_set(&self, scope: &PropertyScope<'_>, msg: &Message) -> Message {
        let (interface, name) = (string_arg(msg, 0), string_arg(msg, 1));
        let value = msg
            .args()
            .get(2)
            .cloned()
            .map(Value::into_inner)
            .unwrap_or(Value::Bool(false));
        let (owner, property) = match scope.lookup(interface, name) {
            Lookup::NoInterface => return interface_not_found(msg, interface),
            Lookup::NoProperty => return property_not_found(msg, interface, name),
            Lookup::Found(owner, property) => (owner, property),
        };
        if !property.access.writable() {
            return msg.create_error_reply_of(
                ErrorType::PropertyReadOnly,
                format!("Property {} is read-only", qualified(interface, name)),
            );
        }
        if value.signature() != property.signature {
            return msg.create_error_reply_of(
                ErrorType::InvalidArgs,
                format!(
                    "Invalid arguments for writing to property {}",
                    qualified(interface, name)
                ),
            );
        }
        let ObjectKind::Exported(exported) = owner.kind() else {
            return property_not_found(msg, interface, name);
        };
        match exported.set_property(name, value) {
            Ok(()) => msg.create_reply(Vec::new()),
            Err(MethodError::Dbus(error)) => msg.create_error_reply(&error),
            Err(MethodError::Failed(text)) => {
                debug!("'{}' failed writing {}: {}", self.name, name, text);
                msg.create_error_reply_of(ErrorType::InternalError, "Internal error")
            }
        }
    }

    fn property_get_all(&self, scope: &PropertyScope<'_>, msg: &Message) -> Message {
        let interface = string_arg(msg, 0);
        let Some(properties) = scope.readable(interface) else {
            return interface_not_found(msg, interface);
        };
        let entries = properties
            .into_iter()
            .filter_map(|(owner, property)| {
                read(owner, &property.name)
                    .map(|value| (Value::from(property.name.as_str()), Value::variant(value)))
            })
            .collect();
        msg.create_reply(vec![Value::Dict {
            key: "s".into(),
            value: "v".into(),
            entries,
        }])
    }
}
