//! Signal Tests - subscriptions across connections
//!
//! These tests exercise signal delivery on the in-process bus:
//! - Member, interface, path and argument filters
//! - Subscriptions to well-known names that change owner
//! - Delivery to objects living on another thread
//! - Spy hooks observing traffic before dispatch

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use busline::{ObjectRef, RegisterOptions, SignalMatch};
use busline_wire::{BusKind, Message, MessageType, Value};

use common::*;

fn computed(from: &str) -> SignalMatch {
    SignalMatch::new()
        .service(from)
        .interface(CALC_INTERFACE)
        .member("Computed")
}

#[test]
fn test_signal_reaches_subscriber() {
    let registry = memory_registry();
    let emitter_conn = registry.connect_to_bus(BusKind::Session, "emitter");
    let listener_conn = registry.connect_to_bus(BusKind::Session, "listener");

    let calc = ObjectRef::new(Calculator::default());
    emitter_conn.register_object(CALC_PATH, &calc, RegisterOptions::EXPORT_ALL_SIGNALS);

    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());
    assert!(listener_conn.connect_signal(&computed(&emitter_conn.base_service()), &target, "Record"));

    for value in 1..=3 {
        assert!(calc.emit_signal("Computed", vec![Value::Int32(value)]));
    }
    assert!(pump_until(|| recorder.count() == 3));
    assert_eq!(
        recorder.values(),
        vec![vec![Value::Int32(1)], vec![Value::Int32(2)], vec![Value::Int32(3)]]
    );
}

#[test]
fn test_shared_rule_survives_one_disconnect() {
    let registry = memory_registry();
    let emitter_conn = registry.connect_to_bus(BusKind::Session, "emitter");
    let listener_conn = registry.connect_to_bus(BusKind::Session, "listener");
    let calc = ObjectRef::new(Calculator::default());
    emitter_conn.register_object(CALC_PATH, &calc, RegisterOptions::EXPORT_ALL_SIGNALS);

    let first = Recorder::default();
    let second = Recorder::default();
    let first_target = ObjectRef::new(first.clone());
    let second_target = ObjectRef::new(second.clone());
    let filter = computed(&emitter_conn.base_service());
    assert!(listener_conn.connect_signal(&filter, &first_target, "Record"));
    assert!(listener_conn.connect_signal(&filter, &second_target, "Record"));
    assert!(listener_conn.disconnect_signal(&filter, &first_target, "Record"));

    calc.emit_signal("Computed", vec![Value::Int32(7)]);
    assert!(pump_until(|| second.count() == 1));
    pump_for(20);
    assert_eq!(first.count(), 0);
}

#[test]
fn test_filters() {
    let registry = memory_registry();
    let emitter_conn = registry.connect_to_bus(BusKind::Session, "emitter");
    let listener_conn = registry.connect_to_bus(BusKind::Session, "listener");
    let me = emitter_conn.base_service();

    let by_path = Recorder::default();
    let by_arg = Recorder::default();
    let by_interface = Recorder::default();
    let path_target = ObjectRef::new(by_path.clone());
    let arg_target = ObjectRef::new(by_arg.clone());
    let interface_target = ObjectRef::new(by_interface.clone());

    let path_filter = SignalMatch::new().path("/a").interface("org.busline.test.Events").member("Fired");
    let arg_filter = SignalMatch::new()
        .interface("org.busline.test.Events")
        .member("Fired")
        .args(vec![Some("wanted".to_string())]);
    // every member of the interface
    let interface_filter = SignalMatch::new().service(&me).interface("org.busline.test.Events");
    assert!(listener_conn.connect_signal(&path_filter, &path_target, "Record"));
    assert!(listener_conn.connect_signal(&arg_filter, &arg_target, "Record"));
    assert!(listener_conn.connect_signal(&interface_filter, &interface_target, "Record"));

    let fire = |path: &str, member: &str, arg: &str| {
        emitter_conn.send(Message::signal(path, "org.busline.test.Events", member).with_arg(arg));
    };
    fire("/a", "Fired", "other");
    fire("/b", "Fired", "wanted");
    fire("/b", "Dropped", "wanted");
    assert!(pump_until(|| by_interface.count() == 3));
    pump_for(20);

    assert_eq!(by_path.values(), vec![vec![Value::from("other")]]);
    assert_eq!(by_arg.values(), vec![vec![Value::from("wanted")]]);
    assert_eq!(by_interface.count(), 3);
}

#[test]
fn test_signature_filter_and_slot_check() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "sig");
    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());

    // OnSum takes an int: a string-carrying signal cannot feed it
    let strings = SignalMatch::new()
        .interface("org.busline.test.Events")
        .member("Text")
        .signature("s");
    assert!(!conn.connect_signal(&strings, &target, "OnSum"));
    assert!(!conn.connect_signal(&strings, &target, "NoSuchSlot"));

    let ints = SignalMatch::new()
        .interface("org.busline.test.Events")
        .member("Sum")
        .signature("i");
    assert!(conn.connect_signal(&ints, &target, "OnSum"));

    conn.send(Message::signal("/", "org.busline.test.Events", "Sum").with_arg("not an int"));
    conn.send(Message::signal("/", "org.busline.test.Events", "Sum").with_arg(Value::Int32(5)));
    assert!(pump_until(|| recorder.count() == 1));
    pump_for(20);
    assert_eq!(recorder.values(), vec![vec![Value::Int32(5)]]);
}

#[test]
fn test_well_known_name_follows_owner() {
    let registry = memory_registry();
    let listener_conn = registry.connect_to_bus(BusKind::Session, "listener");
    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());
    let filter = computed("org.busline.test.Emitter");
    assert!(listener_conn.connect_signal(&filter, &target, "Record"));

    let first = registry.connect_to_bus(BusKind::Session, "first");
    let calc = ObjectRef::new(Calculator::default());
    first.register_object(CALC_PATH, &calc, RegisterOptions::EXPORT_ALL_SIGNALS);
    assert!(first.register_service("org.busline.test.Emitter"));
    calc.emit_signal("Computed", vec![Value::Int32(1)]);
    assert!(pump_until(|| recorder.count() == 1));

    // the name moves on; the old owner's signals no longer match
    assert!(first.unregister_service("org.busline.test.Emitter"));
    let second = registry.connect_to_bus(BusKind::Session, "second");
    let calc2 = ObjectRef::new(Calculator::default());
    second.register_object(CALC_PATH, &calc2, RegisterOptions::EXPORT_ALL_SIGNALS);
    assert!(second.register_service("org.busline.test.Emitter"));

    calc.emit_signal("Computed", vec![Value::Int32(2)]);
    calc2.emit_signal("Computed", vec![Value::Int32(3)]);
    assert!(pump_until(|| recorder.count() == 2));
    pump_for(20);
    assert_eq!(recorder.values(), vec![vec![Value::Int32(1)], vec![Value::Int32(3)]]);
}

#[test]
fn test_delivery_on_receiver_thread() {
    let registry = memory_registry();
    let emitter_conn = registry.connect_to_bus(BusKind::Session, "emitter");
    let calc = ObjectRef::new(Calculator::default());
    emitter_conn.register_object(CALC_PATH, &calc, RegisterOptions::EXPORT_ALL_SIGNALS);
    let me = emitter_conn.base_service();

    let recorder = Recorder::default();
    let service = {
        let recorder = recorder.clone();
        ServiceThread::spawn(&registry, "receiver", move |conn| {
            let target = ObjectRef::new(recorder);
            assert!(conn.connect_signal(&computed(&me), &target, "Record"));
        })
    };

    calc.emit_signal("Computed", vec![Value::Int32(9)]);
    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(recorder.values(), vec![vec![Value::Int32(9)]]);
    assert_eq!(recorder.threads.lock()[0], service.home.thread_id());
    drop(service);
}

#[test]
fn test_spy_hooks_see_everything() {
    let registry = memory_registry();
    let seen = Arc::new(AtomicUsize::new(0));
    let signals = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        let signals = signals.clone();
        registry.add_spy_hook(move |msg| {
            seen.fetch_add(1, Ordering::SeqCst);
            if msg.kind() == MessageType::Signal && msg.member() == "Ping" {
                signals.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    let a = registry.connect_to_bus(BusKind::Session, "a");
    let b = registry.connect_to_bus(BusKind::Session, "b");
    let recorder = Recorder::default();
    let target = ObjectRef::new(recorder.clone());
    b.connect_signal(
        &SignalMatch::new().interface("org.busline.test.Events").member("Ping"),
        &target,
        "Record",
    );

    a.send(Message::signal("/", "org.busline.test.Events", "Ping"));
    assert!(pump_until(|| recorder.count() == 1));
    assert_eq!(signals.load(Ordering::SeqCst), 1);
    assert!(seen.load(Ordering::SeqCst) >= 1);
}
