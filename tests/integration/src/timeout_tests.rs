//! Timeout Tests - calls that are never answered
//!
//! - Expiry while the caller pumps its queue
//! - Expiry while the caller blocks
//! - Configured default timeouts
//! - Late replies after expiry
//! - Reply callbacks for replies, errors and expiry

mod common;

use std::time::{Duration, Instant};

use busline::{CallMode, CallStatus, ConnectionConfig, ObjectRef, RegisterOptions};
use busline_wire::{BusKind, ErrorType, Value};

use common::*;

fn parking_service(registry: &busline::ConnectionRegistry) -> (ServiceThread, Calculator) {
    let calc = Calculator::default();
    let exported = calc.clone();
    let service = ServiceThread::spawn(registry, "slow", move |conn| {
        let object = ObjectRef::new(exported);
        conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS);
    });
    (service, calc)
}

#[test]
fn test_cooperative_call_expires() {
    let registry = memory_registry();
    let (service, _calc) = parking_service(&registry);
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let start = Instant::now();
    let reply = client.call(calc_call(&service.base_service, "Park"), CallMode::BlockWithGui, 150);
    let elapsed = start.elapsed();
    let error = reply.to_error().unwrap();
    assert_eq!(error.kind, ErrorType::NoReply);
    assert!(elapsed >= Duration::from_millis(150), "expired after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "expired after {:?}", elapsed);
    assert_eq!(client.last_error().unwrap().kind, ErrorType::NoReply);
}

#[test]
fn test_async_call_expires_on_timer() {
    let registry = memory_registry();
    let (service, calc) = parking_service(&registry);
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let pending = client.async_call(calc_call(&service.base_service, "Park"), 100);
    let watched = pending.clone();
    assert!(pump_until(move || watched.is_finished()));
    assert_eq!(pending.status(), CallStatus::Expired);
    assert_eq!(pending.error().unwrap().kind, ErrorType::NoReply);

    // the late answer changes nothing
    let parked = calc.log.parked.lock().pop().expect("call was parked");
    parked.send_reply(vec!["too late".into()]);
    pump_for(20);
    assert_eq!(pending.status(), CallStatus::Expired);
}

#[test]
fn test_blocked_waiter_expires() {
    let registry = memory_registry();
    let (service, _calc) = parking_service(&registry);
    let target = service.base_service.clone();
    let caller_registry = registry.clone();

    // a thread that never pumps its queue
    let outcome = std::thread::spawn(move || {
        let client = caller_registry.connect_to_bus(BusKind::Session, "blocked");
        let pending = client.async_call(calc_call(&target, "Park"), 100);
        pending.wait_for_finished();
        (pending.status(), pending.error())
    })
    .join()
    .expect("caller thread");
    assert_eq!(outcome.0, CallStatus::Expired);
    assert_eq!(outcome.1.unwrap().kind, ErrorType::NoReply);
}

#[test]
fn test_default_timeout_from_config() {
    let registry = registry_with(ConnectionConfig::new().default_timeout(Duration::from_millis(80)));
    let (service, _calc) = parking_service(&registry);
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let start = Instant::now();
    let reply = client.call(calc_call(&service.base_service, "Park"), CallMode::Block, -1);
    assert_eq!(reply.to_error().unwrap().kind, ErrorType::NoReply);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_reply_callbacks() {
    let registry = memory_registry();
    let (service, _calc) = parking_service(&registry);
    let client = registry.connect_to_bus(BusKind::Session, "client");
    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());
    let to = &service.base_service;

    let add = calc_call(to, "Add").with_arg(Value::Int32(2)).with_arg(Value::Int32(3));
    assert!(client.call_with_callback(add, &target, "OnSum", Some("OnError"), 2000));
    let divide = calc_call(to, "Divide").with_arg(Value::Int32(1)).with_arg(Value::Int32(0));
    assert!(client.call_with_callback(divide, &target, "OnSum", Some("OnError"), 2000));
    assert!(client.call_with_callback(calc_call(to, "Park"), &target, "OnSum", Some("OnError"), 100));
    assert!(!client.call_with_callback(calc_call(to, "Add"), &target, "Missing", None, 100));

    assert!(pump_until(|| recorder.count() == 3));
    let received = recorder.received.lock().clone();
    assert!(received.contains(&("OnSum".to_string(), vec![Value::Int32(5)])));
    assert!(received
        .iter()
        .any(|(label, _)| label == &ErrorType::InternalError.name()));
    assert!(received.iter().any(|(label, _)| label == &ErrorType::NoReply.name()));
}

#[test]
fn test_reply_with_wrong_signature_is_an_error() {
    let registry = memory_registry();
    let (service, _calc) = parking_service(&registry);
    let client = registry.connect_to_bus(BusKind::Session, "client");
    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());

    // Echo answers with a string, OnSum wants an int
    let echo = calc_call(&service.base_service, "Echo").with_arg("five");
    assert!(client.call_with_callback(echo, &target, "OnSum", Some("OnError"), 2000));
    assert!(pump_until(|| recorder.count() == 1));
    let received = recorder.received.lock().clone();
    assert_eq!(received[0].0, ErrorType::InvalidSignature.name());
}

#[test]
fn test_unknown_service_fails_fast() {
    let registry = memory_registry();
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let start = Instant::now();
    let reply = client.call(calc_call("org.busline.test.Nobody", "Echo"), CallMode::Block, 200);
    assert_eq!(reply.to_error().unwrap().kind, ErrorType::ServiceUnknown);
    assert!(start.elapsed() < Duration::from_millis(200));
}
