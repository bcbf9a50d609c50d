//! Introspection XML generated from declared descriptors

use std::fmt::Write;

use busline_wire::signature::split_signature;

use crate::export::{ObjectKind, ObjectRef, RegisterOptions};

pub(crate) const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub(crate) const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const PROPERTIES_XML: &str = "  <interface name=\"org.freedesktop.DBus.Properties\">\n\
\x20   <method name=\"Get\">\n\
\x20     <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n\
\x20     <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n\
\x20     <arg name=\"value\" type=\"v\" direction=\"out\"/>\n\
\x20   </method>\n\
\x20   <method name=\"Set\">\n\
\x20     <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n\
\x20     <arg name=\"property_name\" type=\"s\" direction=\"in\"/>\n\
\x20     <arg name=\"value\" type=\"v\" direction=\"in\"/>\n\
\x20   </method>\n\
\x20   <method name=\"GetAll\">\n\
\x20     <arg name=\"interface_name\" type=\"s\" direction=\"in\"/>\n\
\x20     <arg name=\"values\" type=\"a{sv}\" direction=\"out\"/>\n\
\x20   </method>\n\
\x20   <signal name=\"PropertiesChanged\">\n\
\x20     <arg name=\"interface_name\" type=\"s\" direction=\"out\"/>\n\
\x20     <arg name=\"changed_properties\" type=\"a{sv}\" direction=\"out\"/>\n\
\x20     <arg name=\"invalidated_properties\" type=\"as\" direction=\"out\"/>\n\
\x20   </signal>\n\
\x20 </interface>\n";

const INTROSPECTABLE_XML: &str = "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n\
\x20   <method name=\"Introspect\">\n\
\x20     <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n\
\x20   </method>\n\
\x20 </interface>\n";

fn write_args(xml: &mut String, signature: &str, direction: Option<&str>) {
    for arg in split_signature(signature).unwrap_or_default() {
        match direction {
            Some(direction) => {
                let _ = writeln!(xml, "      <arg type=\"{}\" direction=\"{}\"/>", arg, direction);
            }
            None => {
                let _ = writeln!(xml, "      <arg type=\"{}\"/>", arg);
            }
        }
    }
}

/// The `<interface>` block of one exported object, limited to what
/// `flags` exports
pub(crate) fn interface_xml(object: &ObjectRef, flags: RegisterOptions) -> String {
    let mut body = String::new();
    for property in object.properties().iter().filter(|p| flags.contains(p.export_flag())) {
        let _ = writeln!(
            body,
            "    <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
            property.name,
            property.signature,
            property.access.as_str()
        );
    }
    for signal in object.signals().iter().filter(|s| flags.contains(s.export_flag())) {
        if signal.signature.is_empty() {
            let _ = writeln!(body, "    <signal name=\"{}\"/>", signal.name);
        } else {
            let _ = writeln!(body, "    <signal name=\"{}\">", signal.name);
            write_args(&mut body, &signal.signature, None);
            body.push_str("    </signal>\n");
        }
    }
    for method in object.methods().iter().filter(|m| flags.contains(m.export_flag())) {
        if method.input.is_empty() && method.output.is_empty() {
            let _ = writeln!(body, "    <method name=\"{}\"/>", method.name);
        } else {
            let _ = writeln!(body, "    <method name=\"{}\">", method.name);
            write_args(&mut body, &method.input, Some("in"));
            write_args(&mut body, &method.output, Some("out"));
            body.push_str("    </method>\n");
        }
    }
    if body.is_empty() {
        return String::new();
    }
    format!("  <interface name=\"{}\">\n{}  </interface>\n", object.interface(), body)
}

/// Full `Introspect()` answer for a tree node.
///
/// `children` lists the active tree children; an object exporting its
/// child objects lists those instead.
pub(crate) fn introspect_node(
    path: &str,
    handler: Option<&ObjectRef>,
    flags: RegisterOptions,
    children: &[String],
) -> String {
    let mut xml = String::from(DOCTYPE);
    xml.push_str("<node>\n");

    if let Some(object) = handler {
        match object.kind() {
            ObjectKind::Exported(_) => {
                if flags.intersects(RegisterOptions::EXPORT_ALL_CONTENTS) {
                    xml.push_str(&interface_xml(object, flags));
                }
                if flags.contains(RegisterOptions::EXPORT_ADAPTORS) {
                    for adaptor in object.adaptors() {
                        xml.push_str(&interface_xml(adaptor, RegisterOptions::EXPORT_ALL_CONTENTS));
                    }
                }
            }
            ObjectKind::Virtual(virtual_object) => xml.push_str(&virtual_object.introspect(path)),
        }
        xml.push_str(PROPERTIES_XML);
    }
    xml.push_str(INTROSPECTABLE_XML);

    let child_names: Vec<String> = match handler {
        Some(object) if flags.contains(RegisterOptions::EXPORT_CHILD_OBJECTS) => object
            .children()
            .iter()
            .map(|c| c.name().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        _ => children.to_vec(),
    };
    for name in child_names {
        let _ = writeln!(xml, "  <node name=\"{}\"/>", name);
    }
    xml.push_str("</node>\n");
    xml
}
