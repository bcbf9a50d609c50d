//! Peer Tests - direct connections without a bus
//!
//! - Servers accepting peers and handing them to a handler
//! - Calls and signals over a peer link
//! - Failures when addresses are wrong or taken
//! - Pending calls failing when the other side goes away
//! - Accepted peers leaving the registry when their client leaves

mod common;

use std::sync::Arc;

use busline::{CallMode, CallStatus, ConnectionHandle, ConnectionMode, ObjectRef, RegisterOptions, SignalMatch};
use busline_wire::{BusKind, ErrorType, Message, Value};
use parking_lot::Mutex;

use common::*;

/// A listening server that keeps every accepted peer
fn server(registry: &busline::ConnectionRegistry) -> (ConnectionHandle, Arc<Mutex<Vec<ConnectionHandle>>>) {
    let server = registry.listen("", "server");
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let sink = accepted.clone();
    server.set_new_connection_handler(move |peer| sink.lock().push(peer));
    (server, accepted)
}

#[test]
fn test_accept_and_call() {
    let registry = memory_registry();
    let (server, accepted) = server(&registry);
    assert_eq!(server.mode(), ConnectionMode::Server);
    let address = server.address().expect("listening address");
    assert!(address.starts_with("memory:peer="));

    let client = registry.connect_to_peer(&address, "client");
    assert!(client.is_connected());
    assert_eq!(client.mode(), ConnectionMode::Peer);
    assert!(client.base_service().is_empty());
    assert!(client.bus_interface().is_none());

    assert!(pump_until(|| accepted.lock().len() == 1));
    let peer = accepted.lock()[0].clone();
    assert_eq!(peer.mode(), ConnectionMode::Peer);
    assert_eq!(peer.name(), "server-1");
    assert_eq!(registry.get("server-1"), Some(peer.clone()));

    let calc = Calculator::default();
    let object = ObjectRef::new(calc.clone());
    assert!(peer.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS));

    let msg = calc_call("", "Add").with_arg(Value::Int32(4)).with_arg(Value::Int32(5));
    let reply = client.call(msg, CallMode::BlockWithGui, 2000);
    assert_eq!(reply.args(), &[Value::Int32(9)]);

    // peers have no bus to ask; names are only recorded
    assert!(client.register_service("org.busline.test.Peer"));
    assert_eq!(client.service_names(), vec!["org.busline.test.Peer".to_string()]);
    assert!(client.unregister_service("org.busline.test.Peer"));
    assert!(!server.register_service("org.busline.test.Server"));
}

#[test]
fn test_signals_between_peers() {
    let registry = memory_registry();
    let (server, accepted) = server(&registry);
    let client = registry.connect_to_peer(&server.address().unwrap_or_default(), "client");
    assert!(pump_until(|| accepted.lock().len() == 1));
    let peer = accepted.lock()[0].clone();

    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());
    let filter = SignalMatch::new().interface("org.busline.test.Events").member("Tick");
    assert!(client.connect_signal(&filter, &target, "Record"));

    peer.send(Message::signal("/clock", "org.busline.test.Events", "Tick").with_arg(Value::Int32(1)));
    peer.send(Message::signal("/clock", "org.busline.test.Events", "Tock").with_arg(Value::Int32(2)));
    assert!(pump_until(|| recorder.count() == 1));
    pump_for(20);
    assert_eq!(recorder.values(), vec![vec![Value::Int32(1)]]);
}

#[test]
fn test_pending_call_fails_when_peer_leaves() {
    let registry = memory_registry();
    let (server, accepted) = server(&registry);
    let client = registry.connect_to_peer(&server.address().unwrap_or_default(), "client");
    assert!(pump_until(|| accepted.lock().len() == 1));

    let calc = Calculator::default();
    let object = ObjectRef::new(calc.clone());
    accepted.lock()[0].register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);
    let pending = client.async_call(calc_call("", "Park"), 5000);
    assert!(pump_until(|| !calc.log.parked.lock().is_empty()));

    // last references to the accepted peer go away
    accepted.lock().clear();
    assert!(registry.disconnect_from_peer("server-1"));

    assert!(pending.is_finished());
    assert_eq!(pending.status(), CallStatus::Expired);
    let error = pending.error().unwrap();
    assert_eq!(error.kind, ErrorType::Disconnected);
    assert_eq!(error.message, "Not connected to server");
    assert!(!client.is_connected());
    assert_eq!(client.last_error().unwrap().kind, ErrorType::Disconnected);

    // the parked answer has nowhere to go
    let parked = calc.log.parked.lock().pop().expect("parked call");
    assert!(!parked.send_reply(vec!["gone".into()]));
}

#[test]
fn test_accepted_peer_unlisted_when_client_leaves() {
    let registry = memory_registry();
    let (server, accepted) = server(&registry);
    let address = server.address().unwrap_or_default();
    let client = registry.connect_to_peer(&address, "client");
    assert!(pump_until(|| accepted.lock().len() == 1));
    let peer = accepted.lock()[0].clone();
    assert_eq!(registry.get("server-1"), Some(peer.clone()));

    assert!(registry.disconnect_from_peer("client"));
    drop(client);

    assert!(!peer.is_connected());
    assert_eq!(peer.last_error().unwrap().kind, ErrorType::Disconnected);
    assert!(registry.get("server-1").is_none());

    // the server keeps accepting under fresh names
    let again = registry.connect_to_peer(&address, "again");
    assert!(again.is_connected());
    assert!(pump_until(|| accepted.lock().len() == 2));
    assert_eq!(accepted.lock()[1].name(), "server-2");
    assert!(registry.get("server-2").is_some());
}

#[test]
fn test_bad_addresses() {
    let registry = memory_registry();

    let missing = registry.connect_to_peer("memory:peer=404", "missing");
    assert!(!missing.is_connected());
    assert_eq!(missing.mode(), ConnectionMode::Invalid);
    assert_eq!(missing.last_error().unwrap().kind, ErrorType::NoServer);

    let bad = registry.listen("tcp:host=localhost", "bad");
    assert!(!bad.is_connected());
    assert!(bad.address().is_none());
    assert_eq!(bad.last_error().unwrap().kind, ErrorType::BadAddress);

    let first = registry.listen("memory:peer=fixed", "first");
    assert_eq!(first.address().as_deref(), Some("memory:peer=fixed"));
    let second = registry.listen("memory:peer=fixed", "second");
    assert_eq!(second.last_error().unwrap().kind, ErrorType::AddressInUse);
}

#[test]
fn test_named_connections() {
    let registry = memory_registry();
    let a = registry.connect_to_bus(BusKind::Session, "shared");
    let b = registry.connect_to_bus(BusKind::System, "shared");
    assert_eq!(a, b);
    assert_eq!(a.base_service(), b.base_service());

    // unnamed connections are never shared or listed
    let c = registry.connect_to_bus(BusKind::Session, "");
    let d = registry.connect_to_bus(BusKind::Session, "");
    assert_ne!(c, d);
    assert_ne!(c.base_service(), d.base_service());

    assert!(!registry.disconnect_from_peer("shared"));
    assert!(registry.disconnect_from_bus("shared"));
    assert!(registry.get("shared").is_none());
    // handles keep the connection usable
    assert!(a.is_connected());
    drop((a, b));

    let listed = registry.connect_to_bus(BusKind::Session, "listed");
    registry.shutdown();
    assert!(!listed.is_connected());
    assert!(c.is_connected());
}
