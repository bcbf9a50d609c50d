//! Shared fixtures for the integration tests
//!
//! Every test builds its own [`ConnectionRegistry`] over a fresh
//! [`MemoryConnector`], so buses and listeners never leak between tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use busline::{
    CallContext, ConnectionConfig, ConnectionHandle, ConnectionRegistry, DelayedReply,
    ExportedObject, LoopHandle, MethodDescriptor, MethodError, MethodResult, PropertyAccess,
    PropertyDescriptor, SignalDescriptor,
};
use busline_wire::{BusKind, MemoryConnector, Message, Value};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub const CALC_INTERFACE: &str = "org.busline.test.Calculator";
pub const CALC_PATH: &str = "/calculator";
pub const RECORDER_INTERFACE: &str = "org.busline.test.Recorder";

/// Route test logs through the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn memory_registry() -> ConnectionRegistry {
    init_tracing();
    ConnectionRegistry::new(Arc::new(MemoryConnector::new()), ConnectionConfig::default())
}

pub fn registry_with(config: ConnectionConfig) -> ConnectionRegistry {
    init_tracing();
    ConnectionRegistry::new(Arc::new(MemoryConnector::new()), config)
}

/// Pump this thread's queue until `done`, for at most five seconds
pub fn pump_until(mut done: impl FnMut() -> bool) -> bool {
    LoopHandle::current().run_until(&mut done, Some(Instant::now() + Duration::from_secs(5)))
}

pub fn pump_for(ms: u64) {
    LoopHandle::current().run_for(Duration::from_millis(ms));
}

pub fn calc_call(destination: &str, member: &str) -> Message {
    Message::method_call(destination, CALC_PATH, CALC_INTERFACE, member)
}

/// Counts calls and remembers where they ran
#[derive(Default)]
pub struct CallLog {
    pub calls: AtomicU64,
    pub threads: Mutex<Vec<ThreadId>>,
    pub parked: Mutex<Vec<DelayedReply>>,
}

/// Arithmetic service used by most tests
#[derive(Clone, Default)]
pub struct Calculator {
    pub log: Arc<CallLog>,
}

impl ExportedObject for Calculator {
    fn interface(&self) -> &str {
        CALC_INTERFACE
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::slot("Add", "ii", "i"),
            MethodDescriptor::slot("Echo", "s", "s"),
            MethodDescriptor::slot("Sleep", "u", ""),
            MethodDescriptor::slot("Whoami", "", "s"),
            MethodDescriptor::slot("Park", "", "s"),
            MethodDescriptor::slot("Divide", "ii", "i"),
            MethodDescriptor::slot("Via", "", "s"),
        ]
    }

    fn signals(&self) -> Vec<SignalDescriptor> {
        vec![SignalDescriptor::new("Computed", "i")]
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        vec![PropertyDescriptor::new("Calls", "t", PropertyAccess::Read)]
    }

    fn invoke(&self, method: &str, ctx: &CallContext<'_>) -> MethodResult {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        self.log.threads.lock().push(thread::current().id());
        let int = |i: usize| match ctx.args().get(i) {
            Some(Value::Int32(v)) => *v,
            _ => 0,
        };
        match method {
            "Add" => Ok(vec![Value::Int32(int(0) + int(1))]),
            "Divide" => match int(1) {
                0 => Err(MethodError::failed("division by zero")),
                d => Ok(vec![Value::Int32(int(0) / d)]),
            },
            "Echo" => Ok(ctx.args().to_vec()),
            "Sleep" => {
                if let Some(Value::UInt32(ms)) = ctx.args().first() {
                    thread::sleep(Duration::from_millis(u64::from(*ms)));
                }
                Ok(Vec::new())
            }
            "Whoami" => Ok(vec![ctx.sender().into()]),
            "Via" => {
                let name = ConnectionRegistry::sender().map(|c| c.name().to_string());
                Ok(vec![name.unwrap_or_default().into()])
            }
            "Park" => {
                self.log.parked.lock().push(ctx.set_delayed_reply());
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn property(&self, name: &str) -> Option<Value> {
        (name == "Calls").then(|| Value::UInt64(self.log.calls.load(Ordering::SeqCst)))
    }
}

/// Collects what its slots receive
#[derive(Clone, Default)]
pub struct Recorder {
    pub received: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    pub threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl Recorder {
    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn values(&self) -> Vec<Vec<Value>> {
        self.received.lock().iter().map(|(_, args)| args.clone()).collect()
    }
}

impl ExportedObject for Recorder {
    fn interface(&self) -> &str {
        RECORDER_INTERFACE
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::message_slot("Record"),
            MethodDescriptor::slot("OnSum", "i", ""),
            MethodDescriptor::message_slot("OnError"),
        ]
    }

    fn invoke(&self, method: &str, ctx: &CallContext<'_>) -> MethodResult {
        let label = match method {
            "OnError" => ctx.message().error_name().to_string(),
            other => other.to_string(),
        };
        self.threads.lock().push(thread::current().id());
        self.received.lock().push((label, ctx.args().to_vec()));
        Ok(Vec::new())
    }
}

/// A bus connection living on its own pumping thread
pub struct ServiceThread {
    pub base_service: String,
    pub home: LoopHandle,
    pub connection: ConnectionHandle,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServiceThread {
    /// Open `name` on a new thread and run `setup` there before pumping
    pub fn spawn<F>(registry: &ConnectionRegistry, name: &str, setup: F) -> Self
    where
        F: FnOnce(&ConnectionHandle) + Send + 'static,
    {
        let registry = registry.clone();
        let name = name.to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let stopping = stop.clone();
        let join = thread::Builder::new()
            .name(format!("service-{}", name))
            .spawn(move || {
                let conn = registry.connect_to_bus(BusKind::Session, &name);
                setup(&conn);
                let home = LoopHandle::current();
                let _ = tx.send((conn.clone(), home.clone()));
                home.run_until(|| stopping.load(Ordering::SeqCst), None);
            })
            .expect("spawn service thread");
        let (connection, home) = rx.recv().expect("service thread started");
        Self {
            base_service: connection.base_service(),
            home,
            connection,
            stop,
            join: Some(join),
        }
    }

    /// Stop pumping and wait for the thread to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.home.wake();
        if let Some(join) = self.join.take() {
            join.join().expect("service thread panicked");
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}
