//! The `org.freedesktop.DBus` driver of the in-process bus

use tracing::debug;

use super::{BusCore, BusState, MemoryTransport, NameOwner};
use crate::error::ErrorType;
use crate::message::{Message, MessageType};
use crate::names::is_valid_bus_name;
use crate::transport::Transport;
use crate::value::Value;

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// RequestName flags
const ALLOW_REPLACEMENT: u32 = 0x1;
const REPLACE_EXISTING: u32 = 0x2;

/// RequestName replies
const PRIMARY_OWNER: u32 = 1;
const EXISTS: u32 = 3;
const ALREADY_OWNER: u32 = 4;

/// ReleaseName replies
const RELEASED: u32 = 1;
const NON_EXISTENT: u32 = 2;
const NOT_OWNER: u32 = 3;

fn driver_signal(state: &mut BusState, member: &str, args: Vec<Value>) -> Message {
    let mut signal = Message::signal(DBUS_PATH, DBUS_INTERFACE, member).with_args(args);
    signal.set_sender(DBUS_SERVICE);
    signal.set_serial(BusCore::driver_serial(state));
    signal
}

pub(super) fn name_owner_changed(state: &mut BusState, name: &str, old: &str, new: &str) -> Message {
    driver_signal(
        state,
        "NameOwnerChanged",
        vec![name.into(), old.into(), new.into()],
    )
}

fn unicast(state: &mut BusState, member: &str, name: &str, to: &str) -> Message {
    let mut signal = driver_signal(state, member, vec![name.into()]);
    signal.set_destination(to);
    signal
}

pub(super) fn list_names(state: &BusState) -> Vec<String> {
    let mut names = vec![DBUS_SERVICE.to_string()];
    names.extend(state.endpoints.keys().cloned());
    names.extend(state.names.keys().cloned());
    names
}

fn string_arg(msg: &Message, index: usize) -> Option<String> {
    msg.args().get(index).and_then(Value::as_str).map(str::to_string)
}

/// Outcome of one driver method
enum Outcome {
    Reply(Vec<Value>),
    Error(ErrorType, String),
}

/// Answer a method call addressed to the bus itself
pub(super) fn handle(core: &BusCore, from: &MemoryTransport, msg: Message) {
    if msg.kind() != MessageType::MethodCall {
        return;
    }
    let me = from.unique_name();
    let mut signals = Vec::new();

    let outcome = {
        let mut state = core.state.lock();
        match msg.member() {
            "Hello" => Outcome::Reply(vec![me.clone().into()]),
            "GetId" => Outcome::Reply(vec![core.id.clone().into()]),
            "ListNames" => Outcome::Reply(vec![Value::string_array(list_names(&state))]),
            "GetNameOwner" => match string_arg(&msg, 0) {
                Some(name) => match BusCore::owner_of(&state, &name) {
                    Some(owner) => Outcome::Reply(vec![owner.into()]),
                    None => Outcome::Error(
                        ErrorType::NameHasNoOwner,
                        format!("Could not get owner of name '{}': no such name", name),
                    ),
                },
                None => invalid_args(&msg),
            },
            "NameHasOwner" => match string_arg(&msg, 0) {
                Some(name) => {
                    Outcome::Reply(vec![BusCore::owner_of(&state, &name).is_some().into()])
                }
                None => invalid_args(&msg),
            },
            "RequestName" => {
                let flags = msg.args().get(1).and_then(Value::as_u32).unwrap_or(0);
                match string_arg(&msg, 0) {
                    Some(name) if is_valid_bus_name(&name) && !name.starts_with(':') => {
                        request_name(&mut state, &name, &me, flags, &mut signals)
                    }
                    Some(name) => Outcome::Error(
                        ErrorType::InvalidArgs,
                        format!("Cannot acquire a service named '{}'", name),
                    ),
                    None => invalid_args(&msg),
                }
            }
            "ReleaseName" => match string_arg(&msg, 0) {
                Some(name) => release_name(&mut state, &name, &me, &mut signals),
                None => invalid_args(&msg),
            },
            "AddMatch" => match string_arg(&msg, 0) {
                Some(rule) => match from.add_match(&rule) {
                    Ok(()) => Outcome::Reply(Vec::new()),
                    Err(err) => Outcome::Error(ErrorType::InvalidArgs, err.to_string()),
                },
                None => invalid_args(&msg),
            },
            "RemoveMatch" => match string_arg(&msg, 0) {
                Some(rule) => match from.remove_match(&rule) {
                    Ok(()) => Outcome::Reply(Vec::new()),
                    Err(err) => Outcome::Error(ErrorType::MatchRuleNotFound, err.to_string()),
                },
                None => invalid_args(&msg),
            },
            other => Outcome::Error(
                ErrorType::UnknownMethod,
                format!("Unknown method '{}' on the bus driver", other),
            ),
        }
    };

    if msg.is_reply_required() {
        let mut reply = match outcome {
            Outcome::Reply(args) => msg.create_reply(args),
            Outcome::Error(kind, text) => {
                debug!("bus driver error for {}: {}", msg.member(), text);
                msg.create_error_reply_of(kind, text)
            }
        };
        reply.set_sender(DBUS_SERVICE);
        from.deliver(reply);
    }
    for signal in signals {
        core.broadcast(signal);
    }
}

fn invalid_args(msg: &Message) -> Outcome {
    Outcome::Error(
        ErrorType::InvalidArgs,
        format!(
            "Invalid arguments for {} (signature '{}')",
            msg.member(),
            msg.signature()
        ),
    )
}

fn request_name(
    state: &mut BusState,
    name: &str,
    me: &str,
    flags: u32,
    signals: &mut Vec<Message>,
) -> Outcome {
    let current = state.names.get(name).cloned();
    let result = match current {
        None => {
            state.names.insert(
                name.to_string(),
                NameOwner {
                    owner: me.to_string(),
                    allow_replacement: flags & ALLOW_REPLACEMENT != 0,
                },
            );
            signals.push(name_owner_changed(state, name, "", me));
            signals.push(unicast(state, "NameAcquired", name, me));
            PRIMARY_OWNER
        }
        Some(owner) if owner.owner == me => {
            if let Some(entry) = state.names.get_mut(name) {
                entry.allow_replacement = flags & ALLOW_REPLACEMENT != 0;
            }
            ALREADY_OWNER
        }
        Some(owner) if owner.allow_replacement && flags & REPLACE_EXISTING != 0 => {
            state.names.insert(
                name.to_string(),
                NameOwner {
                    owner: me.to_string(),
                    allow_replacement: flags & ALLOW_REPLACEMENT != 0,
                },
            );
            signals.push(unicast(state, "NameLost", name, &owner.owner));
            signals.push(name_owner_changed(state, name, &owner.owner, me));
            signals.push(unicast(state, "NameAcquired", name, me));
            PRIMARY_OWNER
        }
        // no queueing
        Some(_) => EXISTS,
    };
    Outcome::Reply(vec![result.into()])
}

fn release_name(state: &mut BusState, name: &str, me: &str, signals: &mut Vec<Message>) -> Outcome {
    let owner = state.names.get(name).map(|n| n.owner.clone());
    let result = match owner.as_deref() {
        None => NON_EXISTENT,
        Some(owner) if owner != me => NOT_OWNER,
        Some(_) => {
            state.names.remove(name);
            signals.push(name_owner_changed(state, name, me, ""));
            signals.push(unicast(state, "NameLost", name, me));
            RELEASED
        }
    };
    Outcome::Reply(vec![result.into()])
}
