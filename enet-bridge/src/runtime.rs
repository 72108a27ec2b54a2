//! In-process managed runtime whose objects are the typed values of `model`.
//! Used by the Rust API, the C ABI and tests. Tracks pinned class references and live local
//! references, and can be told to fail an allocation, so binding and marshaling discipline is
//! observable.

use std::collections::HashMap;

use crate::managed::{
    Arg, ClassSpec, ManagedError, ManagedRuntime, ADDRESS_CLASS, EVENT_CLASS, PACKET_CLASS,
    PEER_CLASS,
};
use crate::model::{Address, Event, Packet, Peer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    Event,
    Peer,
    Address,
    Packet,
}

impl ClassKind {
    pub fn spec(self) -> ClassSpec {
        match self {
            ClassKind::Event => EVENT_CLASS,
            ClassKind::Peer => PEER_CLASS,
            ClassKind::Address => ADDRESS_CLASS,
            ClassKind::Packet => PACKET_CLASS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constructor(ClassKind);

/// A managed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Bytes(Vec<u8>),
    Address(Address),
    Peer(Peer),
    Packet(Packet),
    Event(Event),
}

impl Value {
    pub fn into_event(self) -> Option<Event> {
        match self {
            Value::Event(e) => Some(e),
            _ => None,
        }
    }
}

struct ClassEntry {
    kind: ClassKind,
    constructor: String,
}

pub struct ModelRuntime {
    classes: HashMap<String, ClassEntry>,
    pinned: usize,
    live_locals: usize,
    fail_in: Option<usize>,
}

impl ModelRuntime {
    /// Runtime with the four standard data carriers registered.
    pub fn new() -> Self {
        let mut classes = HashMap::new();
        for kind in [
            ClassKind::Event,
            ClassKind::Peer,
            ClassKind::Address,
            ClassKind::Packet,
        ] {
            let spec = kind.spec();
            classes.insert(
                spec.name.to_string(),
                ClassEntry {
                    kind,
                    constructor: spec.constructor.to_string(),
                },
            );
        }
        Self {
            classes,
            pinned: 0,
            live_locals: 0,
            fail_in: None,
        }
    }

    /// Unregister a class (as if it were missing from the managed class path).
    pub fn without_class(mut self, name: &str) -> Self {
        self.classes.remove(name);
        self
    }

    /// Replace a class's constructor descriptor.
    pub fn with_constructor(mut self, name: &str, signature: &str) -> Self {
        if let Some(entry) = self.classes.get_mut(name) {
            entry.constructor = signature.to_string();
        }
        self
    }

    /// Make the `n`-th allocation from now fail (1 = the next one).
    pub fn fail_allocation_in(&mut self, n: usize) {
        self.fail_in = Some(n.max(1));
    }

    /// Class references currently pinned with `new_global_ref`.
    pub fn pinned_refs(&self) -> usize {
        self.pinned
    }

    /// Local references handed out and not yet deleted.
    pub fn live_locals(&self) -> usize {
        self.live_locals
    }

    fn allocate(&mut self, value: Value) -> Result<Value, ManagedError> {
        if let Some(n) = self.fail_in {
            if n <= 1 {
                self.fail_in = None;
                return Err(ManagedError::OutOfMemory);
            }
            self.fail_in = Some(n - 1);
        }
        self.live_locals += 1;
        Ok(value)
    }
}

impl Default for ModelRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn optional_peer(arg: &Arg<'_, Value>) -> Option<Option<Peer>> {
    match arg {
        Arg::Object(None) => Some(None),
        Arg::Object(Some(Value::Peer(p))) => Some(Some(p.clone())),
        _ => None,
    }
}

fn optional_packet(arg: &Arg<'_, Value>) -> Option<Option<Packet>> {
    match arg {
        Arg::Object(None) => Some(None),
        Arg::Object(Some(Value::Packet(p))) => Some(Some(p.clone())),
        _ => None,
    }
}

impl ManagedRuntime for ModelRuntime {
    type Class = ClassKind;
    type Ctor = Constructor;
    type Object = Value;

    fn find_class(&mut self, name: &str) -> Option<ClassKind> {
        self.classes.get(name).map(|e| e.kind)
    }

    fn get_constructor(&mut self, class: &ClassKind, signature: &str) -> Option<Constructor> {
        self.classes
            .values()
            .find(|e| e.kind == *class && e.constructor == signature)
            .map(|e| Constructor(e.kind))
    }

    fn new_global_ref(&mut self, class: &ClassKind) -> ClassKind {
        self.pinned += 1;
        *class
    }

    fn delete_global_ref(&mut self, _class: ClassKind) {
        self.pinned = self.pinned.saturating_sub(1);
    }

    fn new_string(&mut self, text: &str) -> Result<Value, ManagedError> {
        self.allocate(Value::Str(text.to_string()))
    }

    fn new_byte_array(&mut self, bytes: &[u8]) -> Result<Value, ManagedError> {
        self.allocate(Value::Bytes(bytes.to_vec()))
    }

    fn new_object(
        &mut self,
        class: &ClassKind,
        ctor: Constructor,
        args: &[Arg<'_, Value>],
    ) -> Result<Value, ManagedError> {
        let name = class.spec().name;
        if ctor.0 != *class {
            return Err(ManagedError::ForeignConstructor(name));
        }
        let value = match (class, args) {
            (ClassKind::Address, [Arg::Object(Some(Value::Str(host))), Arg::Int(port)]) => {
                Value::Address(Address::new(host.clone(), *port))
            }
            (ClassKind::Peer, [Arg::Long(handle), Arg::Object(Some(Value::Address(address)))]) => {
                Value::Peer(Peer {
                    handle: *handle,
                    address: address.clone(),
                })
            }
            (
                ClassKind::Packet,
                [Arg::Long(handle), Arg::Object(Some(Value::Bytes(data))), Arg::Int(flags)],
            ) => Value::Packet(Packet {
                handle: *handle,
                data: data.clone(),
                flags: *flags,
            }),
            (
                ClassKind::Event,
                [Arg::Int(kind), peer, Arg::Byte(channel_id), Arg::Int(data), packet],
            ) => {
                let peer = optional_peer(peer).ok_or(ManagedError::Signature(name))?;
                let packet = optional_packet(packet).ok_or(ManagedError::Signature(name))?;
                Value::Event(Event {
                    kind: *kind,
                    peer,
                    channel_id: *channel_id,
                    data: *data,
                    packet,
                })
            }
            _ => return Err(ManagedError::Signature(name)),
        };
        self.allocate(value)
    }

    fn delete_local_ref(&mut self, object: Value) {
        self.live_locals = self.live_locals.saturating_sub(1);
        drop(object);
    }
}
