//! Threading Tests - objects homed on other threads
//!
//! These tests exercise cross-thread dispatch:
//! - Calls always run on the target object's home thread
//! - Many caller threads against one service
//! - Awaiting calls from async tasks
//! - Objects whose home thread has exited

mod common;

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use busline::{CallMode, CallStatus, ObjectRef, RegisterOptions};
use busline_wire::{BusKind, ErrorType, MessageType, Value};
use futures::future::join_all;

use common::*;

fn calculator_service(registry: &busline::ConnectionRegistry, name: &str) -> (ServiceThread, Calculator) {
    let calc = Calculator::default();
    let exported = calc.clone();
    let service = ServiceThread::spawn(registry, name, move |conn| {
        let object = ObjectRef::new(exported);
        assert!(conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_CONTENTS));
    });
    (service, calc)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_call_on_service_thread() {
    let registry = memory_registry();
    let (service, calc) = calculator_service(&registry, "service");
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let msg = calc_call(&service.base_service, "Add")
        .with_arg(Value::Int32(20))
        .with_arg(Value::Int32(22));
    let reply = client.async_call(msg, 2000).await;
    assert_eq!(reply.kind(), MessageType::MethodReturn);
    assert_eq!(reply.args(), &[Value::Int32(42)]);
    assert_eq!(calc.log.threads.lock().as_slice(), &[service.home.thread_id()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_async_calls() {
    let registry = memory_registry();
    let (service, calc) = calculator_service(&registry, "service");
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let calls = (0..32).map(|i| {
        let msg = calc_call(&service.base_service, "Add")
            .with_arg(Value::Int32(i))
            .with_arg(Value::Int32(1));
        client.async_call(msg, 5000)
    });
    let replies = join_all(calls).await;
    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.args(), &[Value::Int32(i as i32 + 1)]);
    }
    assert_eq!(calc.log.calls.load(Ordering::SeqCst), 32);
    let home = service.home.thread_id();
    assert!(calc.log.threads.lock().iter().all(|t| *t == home));
}

#[test]
fn test_blocking_callers_on_many_threads() {
    let registry = memory_registry();
    let (service, calc) = calculator_service(&registry, "service");
    let target = service.base_service.clone();

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let registry = registry.clone();
            let target = target.clone();
            thread::spawn(move || {
                let conn = registry.connect_to_bus(BusKind::Session, &format!("worker-{}", worker));
                for i in 0..20 {
                    let msg = calc_call(&target, "Add")
                        .with_arg(Value::Int32(worker))
                        .with_arg(Value::Int32(i));
                    let reply = conn.call(msg, CallMode::Block, 5000);
                    assert_eq!(reply.args(), &[Value::Int32(worker + i)]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert_eq!(calc.log.calls.load(Ordering::SeqCst), 160);
}

#[test]
fn test_local_call_waits_for_object_thread() {
    let registry = memory_registry();
    // a thread that only pumps; the object lives there
    let host = ServiceThread::spawn(&registry, "host", |_| {});
    let conn = registry.connect_to_bus(BusKind::Session, "owner");
    let calc = Calculator::default();
    let object = ObjectRef::builder(calc.clone()).home(host.home.clone()).build();
    assert!(conn.register_object(CALC_PATH, &object, RegisterOptions::EXPORT_ALL_SLOTS));

    let msg = calc_call(&conn.base_service(), "Echo").with_arg("hop");
    let reply = conn.call(msg, CallMode::Block, -1);
    assert_eq!(reply.args()[0].as_str(), Some("hop"));
    assert_eq!(calc.log.threads.lock().as_slice(), &[host.home.thread_id()]);
}

#[test]
fn test_object_without_thread() {
    let registry = memory_registry();
    let conn = registry.connect_to_bus(BusKind::Session, "orphanage");
    let client = registry.connect_to_bus(BusKind::Session, "client");
    let orphan = thread::spawn(|| ObjectRef::builder(Calculator::default()).name("orphan").build())
        .join()
        .expect("builder thread");
    assert!(!orphan.home().is_alive());
    assert!(conn.register_object(CALC_PATH, &orphan, RegisterOptions::EXPORT_ALL_SLOTS));

    let msg = calc_call(&conn.base_service(), "Echo").with_arg("anyone?");
    let error = client.call(msg, CallMode::BlockWithGui, 2000).to_error().unwrap();
    assert_eq!(error.kind, ErrorType::InternalError);
    assert_eq!(
        error.message,
        "Object 'orphan' (at path '/calculator') has no thread. Cannot deliver message."
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delayed_reply_from_worker() {
    let registry = memory_registry();
    let (service, calc) = calculator_service(&registry, "service");
    let client = registry.connect_to_bus(BusKind::Session, "client");

    let pending = client.async_call(calc_call(&service.base_service, "Park"), 5000);
    let log = calc.log.clone();
    let answered = tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(parked) = log.parked.lock().pop() {
                return parked.send_reply(vec!["later".into()]);
            }
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    })
    .await
    .expect("worker task");
    assert!(answered);

    let reply = pending.clone().await;
    assert_eq!(reply.args()[0].as_str(), Some("later"));
    assert_eq!(pending.status(), CallStatus::RepliedOk);
}
