//! Ping-pong over the in-process bus
//!
//! A service thread exports `org.busline.PingPong` at `/pingpong` and
//! sends a `Ponged` signal with every answer. The main thread calls `Ping` and
//! counts the signals it receives.
//!
//! Usage:
//!   cargo run -p ping-pong -- --count 5
//!   cargo run -p ping-pong -- --peer --log-level debug

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use busline::{
    CallContext, CallMode, ConnectionConfig, ConnectionHandle, ConnectionRegistry, ExportedObject,
    LoopHandle, MethodDescriptor, MethodResult, ObjectRef, RegisterOptions, SignalDescriptor,
    SignalMatch,
};
use busline_wire::{BusKind, MemoryConnector, Message, Value};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const SERVICE: &str = "org.busline.PingPong";
const INTERFACE: &str = "org.busline.PingPong";
const PATH: &str = "/pingpong";

#[derive(Parser, Debug)]
#[command(about = "Ping a service over an in-process bus")]
struct Options {
    /// Number of pings to send
    #[arg(short, long, default_value_t = 3)]
    count: u32,

    /// Connect peer-to-peer instead of through the bus
    #[arg(long)]
    peer: bool,

    /// Call timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: i32,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

struct PingPong {
    served: AtomicU64,
}

impl ExportedObject for PingPong {
    fn interface(&self) -> &str {
        INTERFACE
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![MethodDescriptor::slot("Ping", "s", "s")]
    }

    fn signals(&self) -> Vec<SignalDescriptor> {
        vec![SignalDescriptor::new("Ponged", "t")]
    }

    fn invoke(&self, _method: &str, ctx: &CallContext<'_>) -> MethodResult {
        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        let text = first_text(ctx.args());
        info!("ping #{} from '{}': {}", served, ctx.sender(), text);
        let announce = Message::signal(PATH, INTERFACE, "Ponged").with_arg(Value::UInt64(served));
        ctx.connection().send(announce);
        Ok(vec![format!("pong: {}", text).into()])
    }
}

/// Leading string argument, or empty
fn first_text(args: &[Value]) -> &str {
    args.first().and_then(Value::as_str).unwrap_or_default()
}

/// Collects `Ponged` signals on the main thread
struct Counter {
    seen: Arc<AtomicU64>,
}

impl ExportedObject for Counter {
    fn interface(&self) -> &str {
        "org.busline.PingPong.Counter"
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![MethodDescriptor::slot("OnPonged", "t", "")]
    }

    fn invoke(&self, _method: &str, _ctx: &CallContext<'_>) -> MethodResult {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Serve pings on a thread of its own. Returns the address peers dial,
/// if serving peers.
fn spawn_service(registry: &ConnectionRegistry, peer: bool) -> Result<Option<String>, Box<dyn Error>> {
    let registry = registry.clone();
    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name("pingpong-service".into()).spawn(move || {
        let object = ObjectRef::new(PingPong {
            served: AtomicU64::new(0),
        });
        let flags = RegisterOptions::EXPORT_ALL_SLOTS | RegisterOptions::EXPORT_ALL_SIGNALS;

        let _server = if peer {
            let server = registry.listen("", "pingpong-server");
            let exported = object.clone();
            server.set_new_connection_handler(move |conn: ConnectionHandle| {
                info!("accepted peer '{}'", conn.name());
                conn.register_object(PATH, &exported, flags);
            });
            let _ = tx.send(server.address());
            Some(server)
        } else {
            let conn = registry.connect_to_bus(BusKind::Session, "pingpong-service");
            conn.register_object(PATH, &object, flags);
            if !conn.register_service(SERVICE) {
                warn!("could not own {}: {:?}", SERVICE, conn.last_error());
            }
            let _ = tx.send(None);
            None
        };

        LoopHandle::current().run_until(|| false, None);
    })?;
    Ok(rx.recv()?)
}

fn main() -> Result<(), Box<dyn Error>> {
    let options = Options::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(options.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let registry = ConnectionRegistry::new(Arc::new(MemoryConnector::new()), ConnectionConfig::default());
    let address = spawn_service(&registry, options.peer)?;

    let (client, destination) = match &address {
        Some(address) => (registry.connect_to_peer(address, "pingpong-client"), String::new()),
        None => (registry.connect_to_bus(BusKind::Session, "pingpong-client"), SERVICE.to_string()),
    };
    if !client.is_connected() {
        return Err(format!("client not connected: {:?}", client.last_error()).into());
    }

    let seen = Arc::new(AtomicU64::new(0));
    let counter = ObjectRef::new(Counter { seen: seen.clone() });
    let filter = SignalMatch::new().interface(INTERFACE).member("Ponged");
    client.connect_signal(&filter, &counter, "OnPonged");

    let start = Instant::now();
    for i in 0..options.count {
        let call = Message::method_call(&destination, PATH, INTERFACE, "Ping").with_arg(format!("ping {}", i));
        let reply = client.call(call, CallMode::BlockWithGui, options.timeout_ms);
        match reply.to_error() {
            Some(error) => warn!("ping {} failed: {}", i, error),
            None => {
                let text = first_text(reply.args());
                info!("{}", text);
            }
        }
    }

    let expected = u64::from(options.count);
    LoopHandle::current().run_until(
        || seen.load(Ordering::SeqCst) >= expected,
        Some(Instant::now() + Duration::from_millis(500)),
    );
    info!(
        "{} pings in {:?}, {} Ponged signals seen",
        options.count,
        start.elapsed(),
        seen.load(Ordering::SeqCst)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_text() {
        let reply = Message::method_call(SERVICE, PATH, INTERFACE, "Ping")
            .with_arg("pong: ping 0")
            .create_reply(vec!["pong: ping 0".into()]);
        assert_eq!(first_text(reply.args()), "pong: ping 0");
        assert_eq!(first_text(&[Value::UInt64(3)]), "");
        assert_eq!(first_text(&[]), "");
    }
}
