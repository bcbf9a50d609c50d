//! Loopback Tests - calls a connection answers for itself
//!
//! - Calls to the connection's own unique or well-known name skip the
//!   transport when made from the connection's thread
//! - With loopback disabled the same calls travel through the bus and are
//!   answered while the caller pumps its queue
//! - Built-in Introspectable and Properties interfaces

mod common;

use std::sync::atomic::Ordering;

use busline::{CallMode, ConnectionConfig, ObjectRef, RegisterOptions, UnregisterMode};
use busline_wire::{BusKind, ErrorType, Message, MessageType, Value};

use common::*;

#[test]
fn test_call_own_unique_name() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "loopback");
    let calc = Calculator::default();
    let object = ObjectRef::new(calc.clone());
    assert!(conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS));

    let msg = calc_call(&conn.base_service(), "Add")
        .with_arg(Value::Int32(2))
        .with_arg(Value::Int32(40));
    let reply = conn.call(msg, CallMode::Block, -1);
    assert_eq!(reply.kind(), MessageType::MethodReturn);
    assert_eq!(reply.args(), &[Value::Int32(42)]);

    let reply = conn.call(calc_call(&conn.base_service(), "Whoami"), CallMode::Block, -1);
    assert_eq!(reply.args()[0].as_str(), Some(conn.base_service().as_str()));
    let reply = conn.call(calc_call(&conn.base_service(), "Via"), CallMode::Block, -1);
    assert_eq!(reply.args()[0].as_str(), Some("loopback"));
    assert_eq!(calc.log.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_call_own_service_name() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "named");
    let object = ObjectRef::new(Calculator::default());
    conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);
    assert!(conn.register_service("org.busline.test.Calc"));

    let msg = calc_call("org.busline.test.Calc", "Echo").with_arg("loop");
    let pending = conn.async_call(msg, -1);
    // answered before async_call returned
    assert!(pending.is_finished());
    assert_eq!(pending.reply().unwrap().args()[0].as_str(), Some("loop"));
}

#[test]
fn test_loopback_disabled_goes_through_bus() {
    let registry = registry_with(ConnectionConfig::new().loopback_calls(false));
    let conn = registry.connect_to_bus(BusKind::Session, "no-loop");
    let calc = Calculator::default();
    let object = ObjectRef::new(calc.clone());
    conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);

    let msg = calc_call(&conn.base_service(), "Echo").with_arg("round trip");
    let reply = conn.call(msg, CallMode::BlockWithGui, 2000);
    assert_eq!(reply.args()[0].as_str(), Some("round trip"));
    assert_eq!(reply.sender(), conn.base_service());

    // a plain blocking call cannot be answered by its own blocked thread
    let msg = calc_call(&conn.base_service(), "Echo").with_arg("stuck");
    let reply = conn.call(msg, CallMode::Block, 200);
    assert_eq!(reply.to_error().unwrap().kind, ErrorType::NoReply);
    assert_eq!(conn.last_error().unwrap().kind, ErrorType::NoReply);
}

#[test]
fn test_error_replies() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "errors");
    let me = conn.base_service();
    let object = ObjectRef::new(Calculator::default());
    conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);

    let msg = calc_call(&me, "Divide").with_arg(Value::Int32(1)).with_arg(Value::Int32(0));
    let error = conn.call(msg, CallMode::Block, -1).to_error().unwrap();
    assert_eq!(error.kind, ErrorType::InternalError);
    assert_eq!(error.message, "division by zero");

    let error = conn.call(calc_call(&me, "Nope"), CallMode::Block, -1).to_error().unwrap();
    assert_eq!(error.kind, ErrorType::UnknownMethod);
    assert_eq!(
        error.message,
        "No such method 'Nope' in interface 'org.busline.test.Calculator' at object path '/calculator' (signature '')"
    );

    // wrong argument types do not match the declared slot
    let msg = calc_call(&me, "Add").with_arg("two").with_arg("three");
    let error = conn.call(msg, CallMode::Block, -1).to_error().unwrap();
    assert_eq!(error.kind, ErrorType::UnknownMethod);

    let msg = Message::method_call(&me, CALC_PATH, "", "Echo").with_arg("any interface");
    let reply = conn.call(msg, CallMode::Block, -1);
    assert_eq!(reply.args()[0].as_str(), Some("any interface"));

    let msg = Message::method_call(&me, CALC_PATH, "org.busline.test.Nothing", "Echo");
    let error = conn.call(msg, CallMode::Block, -1).to_error().unwrap();
    assert_eq!(error.kind, ErrorType::UnknownInterface);
    assert_eq!(
        error.message,
        "No such interface 'org.busline.test.Nothing' at object path '/calculator'"
    );
}

#[test]
fn test_builtin_interfaces() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "builtin");
    let me = conn.base_service();
    let object = ObjectRef::new(Calculator::default());
    let flags = RegisterOptions::EXPORT_ALL_SLOTS
        | RegisterOptions::EXPORT_ALL_SIGNALS
        | RegisterOptions::EXPORT_ALL_PROPERTIES;
    conn.register_object(CALC_PATH, &object, flags);
    conn.register_object("/tree/leaf", &object, RegisterOptions::EXPORT_ALL_SLOTS);

    conn.call(calc_call(&me, "Add").with_arg(Value::Int32(1)).with_arg(Value::Int32(1)), CallMode::Block, -1);
    let get = Message::method_call(&me, CALC_PATH, "org.freedesktop.DBus.Properties", "Get")
        .with_arg(CALC_INTERFACE)
        .with_arg("Calls");
    let reply = conn.call(get, CallMode::Block, -1);
    assert_eq!(reply.args()[0], Value::variant(Value::UInt64(1)));

    let introspect = |path: &str| -> String {
        let msg = Message::method_call(&me, path, "org.freedesktop.DBus.Introspectable", "Introspect");
        let reply = conn.call(msg, CallMode::Block, -1);
        reply.args()[0].as_str().unwrap_or_default().to_string()
    };
    let xml = introspect(CALC_PATH);
    assert!(xml.starts_with("<!DOCTYPE node"));
    assert!(xml.contains("<signal name=\"Computed\">"));
    assert!(xml.contains("<property name=\"Calls\" type=\"t\" access=\"read\"/>"));
    assert!(xml.contains("<method name=\"Add\">"));

    let root = introspect("/");
    assert!(root.contains("<node name=\"calculator\"/>"));
    assert!(root.contains("<node name=\"tree\"/>"));
    let tree = introspect("/tree");
    assert!(tree.contains("<node name=\"leaf\"/>"));

    conn.unregister_object("/tree", UnregisterMode::Tree);
    assert!(conn.object_registered_at("/tree/leaf").is_none());
    let error = conn
        .call(
            Message::method_call(&me, "/tree/leaf", CALC_INTERFACE, "Echo").with_arg("x"),
            CallMode::Block,
            -1,
        )
        .to_error()
        .unwrap();
    assert_eq!(error.kind, ErrorType::UnknownObject);
}

#[test]
fn test_no_block_returns_immediately() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "noblock");
    let calc = Calculator::default();
    let object = ObjectRef::new(calc.clone());
    conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);

    let reply = conn.call(calc_call(&conn.base_service(), "Echo").with_arg("x"), CallMode::NoBlock, -1);
    assert_eq!(reply.kind(), MessageType::Invalid);
    assert!(pump_until(|| calc.log.calls.load(Ordering::SeqCst) == 1));
}
