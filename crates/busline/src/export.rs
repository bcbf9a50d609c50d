//! Exported objects
//!
//! An exported object declares its capabilities up front (methods, signals,
//! properties) through descriptors, and the engine builds a member lookup
//! table once, when the [`ObjectRef`] is created. Dispatch then consults
//! that table, with results cached per (member, signature, flags).
//!
//! Each object has a home queue: the thread it was created on unless
//! another is given. Calls and signal deliveries always run there.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use busline_wire::{ErrorType, Value};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::{MethodError, MethodResult};
use crate::event_loop::LoopHandle;

bitflags! {
    /// What a registration exports, plus internal node markers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegisterOptions: u32 {
        const EXPORT_ADAPTORS = 0x01;

        const EXPORT_SCRIPTABLE_SLOTS = 0x10;
        const EXPORT_SCRIPTABLE_SIGNALS = 0x20;
        const EXPORT_SCRIPTABLE_PROPERTIES = 0x40;
        const EXPORT_SCRIPTABLE_INVOKABLES = 0x80;
        const EXPORT_SCRIPTABLE_CONTENTS = 0xf0;

        const EXPORT_NON_SCRIPTABLE_SLOTS = 0x100;
        const EXPORT_NON_SCRIPTABLE_SIGNALS = 0x200;
        const EXPORT_NON_SCRIPTABLE_PROPERTIES = 0x400;
        const EXPORT_NON_SCRIPTABLE_INVOKABLES = 0x800;
        const EXPORT_NON_SCRIPTABLE_CONTENTS = 0xf00;

        const EXPORT_ALL_SLOTS = 0x110;
        const EXPORT_ALL_SIGNALS = 0x220;
        const EXPORT_ALL_PROPERTIES = 0x440;
        const EXPORT_ALL_INVOKABLES = 0x880;
        const EXPORT_ALL_CONTENTS = 0xff0;

        const EXPORT_CHILD_OBJECTS = 0x1000;

        /// Set on nodes holding a virtual object
        const VIRTUAL_OBJECT = 0x1_0000;
        /// Set on virtual-object nodes that answer for their whole subtree
        const SUB_PATH = 0x2_0000;
    }
}

/// How a virtual object is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualObjectMode {
    /// Only the registered path
    SingleNode,
    /// The registered path and every path beneath it
    SubPath,
}

/// Kind of an exported method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Slot,
    Invokable,
}

/// Declared method of an exported object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Input signature
    pub input: String,
    /// Output signature
    pub output: String,
    pub kind: MemberKind,
    pub scriptable: bool,
    /// Accepts any arguments and reads them from the call context
    pub takes_message: bool,
}

impl MethodDescriptor {
    /// A scriptable slot
    pub fn slot(name: impl Into<String>, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            kind: MemberKind::Slot,
            scriptable: true,
            takes_message: false,
        }
    }

    /// A scriptable invokable
    pub fn invokable(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            kind: MemberKind::Invokable,
            ..Self::slot(name, input, output)
        }
    }

    /// A slot that takes whatever arguments the call carries
    pub fn message_slot(name: impl Into<String>) -> Self {
        Self {
            takes_message: true,
            ..Self::slot(name, "", "")
        }
    }

    pub fn non_scriptable(mut self) -> Self {
        self.scriptable = false;
        self
    }

    /// Registration flag that exports this method
    pub fn export_flag(&self) -> RegisterOptions {
        match (self.kind, self.scriptable) {
            (MemberKind::Slot, true) => RegisterOptions::EXPORT_SCRIPTABLE_SLOTS,
            (MemberKind::Slot, false) => RegisterOptions::EXPORT_NON_SCRIPTABLE_SLOTS,
            (MemberKind::Invokable, true) => RegisterOptions::EXPORT_SCRIPTABLE_INVOKABLES,
            (MemberKind::Invokable, false) => RegisterOptions::EXPORT_NON_SCRIPTABLE_INVOKABLES,
        }
    }
}

/// Declared signal of an exported object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub name: String,
    pub signature: String,
    pub scriptable: bool,
}

impl SignalDescriptor {
    pub fn new(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            scriptable: true,
        }
    }

    pub fn non_scriptable(mut self) -> Self {
        self.scriptable = false;
        self
    }

    pub fn export_flag(&self) -> RegisterOptions {
        if self.scriptable {
            RegisterOptions::EXPORT_SCRIPTABLE_SIGNALS
        } else {
            RegisterOptions::EXPORT_NON_SCRIPTABLE_SIGNALS
        }
    }
}

/// Access mode of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropertyAccess {
    pub fn readable(self) -> bool {
        matches!(self, PropertyAccess::Read | PropertyAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropertyAccess::Write | PropertyAccess::ReadWrite)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PropertyAccess::Read => "read",
            PropertyAccess::Write => "write",
            PropertyAccess::ReadWrite => "readwrite",
        }
    }
}

/// Declared property of an exported object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub signature: String,
    pub access: PropertyAccess,
    pub scriptable: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, signature: impl Into<String>, access: PropertyAccess) -> Self {
        Self {
            name: name.into(),
            signature: signature.into(),
            access,
            scriptable: true,
        }
    }

    pub fn non_scriptable(mut self) -> Self {
        self.scriptable = false;
        self
    }

    pub fn export_flag(&self) -> RegisterOptions {
        if self.scriptable {
            RegisterOptions::EXPORT_SCRIPTABLE_PROPERTIES
        } else {
            RegisterOptions::EXPORT_NON_SCRIPTABLE_PROPERTIES
        }
    }
}

/// An object whose declared members can be called over the bus
pub trait ExportedObject: Send + Sync + 'static {
    /// Interface the object's own members belong to
    fn interface(&self) -> &str;

    fn methods(&self) -> Vec<MethodDescriptor> {
        Vec::new()
    }

    fn signals(&self) -> Vec<SignalDescriptor> {
        Vec::new()
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        Vec::new()
    }

    /// Run the declared method `method`. The returned values form the
    /// automatic reply unless the handler replied through `ctx` or delayed
    /// the reply.
    fn invoke(&self, method: &str, ctx: &CallContext<'_>) -> MethodResult;

    fn property(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), MethodError> {
        Err(MethodError::dbus(
            ErrorType::PropertyReadOnly,
            format!("Property '{}' is read-only", name),
        ))
    }

    /// Named child objects, reachable beneath a registration that exports
    /// child objects
    fn children(&self) -> Vec<ObjectRef> {
        Vec::new()
    }
}

/// A handler that receives raw messages for a path, or a whole subtree
pub trait VirtualObject: Send + Sync + 'static {
    /// Handle a call. Returning false lets the built-in filters try.
    fn handle_message(&self, ctx: &CallContext<'_>) -> bool;

    /// Introspection XML fragment for `path`
    fn introspect(&self, _path: &str) -> String {
        String::new()
    }
}

/// Identity of an [`ObjectRef`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Receives lifecycle and signal events of objects it registered
pub(crate) trait ObjectListener: Send + Sync {
    fn object_destroyed(&self, id: ObjectId);

    fn relay_signal(
        &self,
        object: &ObjectRef,
        category: RegisterOptions,
        interface: &str,
        member: &str,
        args: &[Value],
    );
}

/// Cached lookups per object; the cache starts over once it is full
const SLOT_CACHE_LIMIT: usize = 256;

/// Method lookup table built from descriptors
pub(crate) struct SlotTable {
    methods: Vec<MethodDescriptor>,
    by_name: HashMap<String, Vec<usize>>,
    cache: Mutex<HashMap<(String, String, u32), Option<usize>>>,
}

impl SlotTable {
    fn build(methods: Vec<MethodDescriptor>) -> Self {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, method) in methods.iter().enumerate() {
            by_name.entry(method.name.clone()).or_default().push(index);
        }
        Self {
            methods,
            by_name,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, index: usize) -> &MethodDescriptor {
        &self.methods[index]
    }

    pub(crate) fn all(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Method exported under `flags` matching `member` and `signature`
    pub(crate) fn find(&self, member: &str, signature: &str, flags: RegisterOptions) -> Option<usize> {
        // undeclared members are not cached: callers choose them freely
        let candidates = self.by_name.get(member)?;
        let key = (member.to_string(), signature.to_string(), flags.bits());
        if let Some(hit) = self.cache.lock().get(&key) {
            return *hit;
        }
        let exported = |index: &&usize| flags.contains(self.methods[**index].export_flag());
        let found = candidates
            .iter()
            .filter(exported)
            .find(|index| {
                let method = &self.methods[**index];
                !method.takes_message && method.input == signature
            })
            .or_else(|| {
                candidates
                    .iter()
                    .filter(exported)
                    .find(|index| self.methods[**index].takes_message)
            })
            .copied();
        let mut cache = self.cache.lock();
        if cache.len() >= SLOT_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key, found);
        found
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// First method named `name`, regardless of export flags
    pub(crate) fn by_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).and_then(|v| v.first()).copied()
    }
}

pub(crate) enum ObjectKind {
    Exported(Arc<dyn ExportedObject>),
    Virtual(Arc<dyn VirtualObject>),
}

struct ObjectCell {
    id: ObjectId,
    name: String,
    home: LoopHandle,
    kind: ObjectKind,
    interface: String,
    slots: SlotTable,
    signals: Vec<SignalDescriptor>,
    properties: Vec<PropertyDescriptor>,
    /// Sorted by interface name
    adaptors: Vec<ObjectRef>,
    destroyed: AtomicBool,
    listeners: Mutex<Vec<Weak<dyn ObjectListener>>>,
}

/// Shared handle to an exported or virtual object
#[derive(Clone)]
pub struct ObjectRef {
    cell: Arc<ObjectCell>,
}

/// Builds an [`ObjectRef`]
pub struct ObjectBuilder {
    name: String,
    kind: ObjectKind,
    adaptors: Vec<Arc<dyn ExportedObject>>,
    home: Option<LoopHandle>,
}

impl ObjectBuilder {
    /// Object name, used to find it among its parent's children
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach an adaptor exporting one extra interface
    pub fn adaptor(mut self, adaptor: impl ExportedObject) -> Self {
        self.adaptors.push(Arc::new(adaptor));
        self
    }

    /// Home queue; defaults to the building thread's
    pub fn home(mut self, home: LoopHandle) -> Self {
        self.home = Some(home);
        self
    }

    pub fn build(self) -> ObjectRef {
        let home = self.home.unwrap_or_else(LoopHandle::current);
        let mut adaptors: Vec<ObjectRef> = self
            .adaptors
            .into_iter()
            .map(|adaptor| ObjectRef::assemble(String::new(), ObjectKind::Exported(adaptor), Vec::new(), home.clone()))
            .collect();
        adaptors.sort_by(|a, b| a.interface().cmp(b.interface()));
        ObjectRef::assemble(self.name, self.kind, adaptors, home)
    }
}

impl ObjectRef {
    /// Start building an exported object
    pub fn builder(object: impl ExportedObject) -> ObjectBuilder {
        ObjectBuilder {
            name: String::new(),
            kind: ObjectKind::Exported(Arc::new(object)),
            adaptors: Vec::new(),
            home: None,
        }
    }

    /// Start building a virtual object
    pub fn virtual_builder(object: impl VirtualObject) -> ObjectBuilder {
        ObjectBuilder {
            name: String::new(),
            kind: ObjectKind::Virtual(Arc::new(object)),
            adaptors: Vec::new(),
            home: None,
        }
    }

    /// Exported object homed on the current thread
    pub fn new(object: impl ExportedObject) -> Self {
        Self::builder(object).build()
    }

    /// Virtual object homed on the current thread
    pub fn new_virtual(object: impl VirtualObject) -> Self {
        Self::virtual_builder(object).build()
    }

    fn assemble(name: String, kind: ObjectKind, adaptors: Vec<ObjectRef>, home: LoopHandle) -> Self {
        let (interface, methods, signals, properties) = match &kind {
            ObjectKind::Exported(object) => (
                object.interface().to_string(),
                object.methods(),
                object.signals(),
                object.properties(),
            ),
            ObjectKind::Virtual(_) => (String::new(), Vec::new(), Vec::new(), Vec::new()),
        };
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        debug!(
            "created object {} '{}' with {} methods, {} adaptors",
            id,
            name,
            methods.len(),
            adaptors.len()
        );
        Self {
            cell: Arc::new(ObjectCell {
                id,
                name,
                home,
                kind,
                interface,
                slots: SlotTable::build(methods),
                signals,
                properties,
                adaptors,
                destroyed: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.cell.id
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn home(&self) -> &LoopHandle {
        &self.cell.home
    }

    /// Interface of the object's own members
    pub fn interface(&self) -> &str {
        &self.cell.interface
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.cell.kind, ObjectKind::Virtual(_))
    }

    pub fn is_destroyed(&self) -> bool {
        self.cell.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn kind(&self) -> &ObjectKind {
        &self.cell.kind
    }

    pub(crate) fn slots(&self) -> &SlotTable {
        &self.cell.slots
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        self.cell.slots.all()
    }

    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.cell.signals
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.cell.properties
    }

    /// Adaptors, sorted by interface name
    pub fn adaptors(&self) -> &[ObjectRef] {
        &self.cell.adaptors
    }

    /// Adaptor exporting `interface`, by binary search
    pub fn adaptor(&self, interface: &str) -> Option<&ObjectRef> {
        self.cell
            .adaptors
            .binary_search_by(|a| a.interface().cmp(interface))
            .ok()
            .map(|index| &self.cell.adaptors[index])
    }

    /// Current child objects
    pub fn children(&self) -> Vec<ObjectRef> {
        match &self.cell.kind {
            ObjectKind::Exported(object) => object.children(),
            ObjectKind::Virtual(_) => Vec::new(),
        }
    }

    /// Child object named `name`
    pub fn child(&self, name: &str) -> Option<ObjectRef> {
        self.children().into_iter().find(|c| c.name() == name)
    }

    pub(crate) fn property_descriptor(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.cell.properties.iter().find(|p| p.name == name)
    }

    pub(crate) fn add_listener(&self, listener: Weak<dyn ObjectListener>) {
        let mut listeners = self.cell.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        if !listeners.iter().any(|l| Weak::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ObjectListener>> {
        self.cell
            .listeners
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Emit one of the object's own declared signals on every connection
    /// it is registered with. Returns false for undeclared signals.
    pub fn emit_signal(&self, member: &str, args: Vec<Value>) -> bool {
        let Some(signal) = self.cell.signals.iter().find(|s| s.name == member) else {
            warn!("object {} has no signal '{}'", self.cell.id, member);
            return false;
        };
        let category = signal.export_flag();
        for listener in self.live_listeners() {
            listener.relay_signal(self, category, &self.cell.interface, member, &args);
        }
        true
    }

    /// Emit a signal declared by the adaptor for `interface`
    pub fn emit_adaptor_signal(&self, interface: &str, member: &str, args: Vec<Value>) -> bool {
        let declared = self
            .adaptor(interface)
            .map_or(false, |a| a.signals().iter().any(|s| s.name == member));
        if !declared {
            warn!(
                "object {} has no adaptor signal '{}.{}'",
                self.cell.id, interface, member
            );
            return false;
        }
        for listener in self.live_listeners() {
            listener.relay_signal(self, RegisterOptions::EXPORT_ADAPTORS, interface, member, &args);
        }
        true
    }

    /// Destroy the object: it disappears from every connection's object
    /// tree and signal subscriptions
    pub fn destroy(&self) {
        if self.cell.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for adaptor in &self.cell.adaptors {
            adaptor.cell.destroyed.store(true, Ordering::SeqCst);
        }
        let listeners: Vec<_> = std::mem::take(&mut *self.cell.listeners.lock());
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.object_destroyed(self.cell.id);
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.cell.id == other.cell.id
    }
}

impl Eq for ObjectRef {}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.cell.id)
            .field("name", &self.cell.name)
            .field("interface", &self.cell.interface)
            .field("virtual", &self.is_virtual())
            .finish()
    }
}
