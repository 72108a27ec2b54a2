//! The managed side of the boundary: class lookup, constructor lookup, object construction.
//! Modelled on JNI's reflective surface so a JNI-backed runtime can implement it directly.

/// Constructor argument as passed across the boundary.
pub enum Arg<'a, O> {
    Int(i32),
    Long(i64),
    Byte(i8),
    Object(Option<&'a O>),
}

/// Name and constructor descriptor of one managed data carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSpec {
    pub name: &'static str,
    pub constructor: &'static str,
}

pub const EVENT_CLASS: ClassSpec = ClassSpec {
    name: "com/enet/ENetEvent",
    constructor: "(ILcom/enet/ENetPeer;BILcom/enet/ENetPacket;)V",
};

pub const PEER_CLASS: ClassSpec = ClassSpec {
    name: "com/enet/ENetPeer",
    constructor: "(JLcom/enet/ENetAddress;)V",
};

pub const ADDRESS_CLASS: ClassSpec = ClassSpec {
    name: "com/enet/ENetAddress",
    constructor: "(Ljava/lang/String;I)V",
};

pub const PACKET_CLASS: ClassSpec = ClassSpec {
    name: "com/enet/ENetPacket",
    constructor: "(J[BI)V",
};

#[derive(Debug, thiserror::Error)]
pub enum ManagedError {
    #[error("managed allocation failed")]
    OutOfMemory,
    #[error("arguments do not match constructor of {0}")]
    Signature(&'static str),
    #[error("constructor does not belong to class {0}")]
    ForeignConstructor(&'static str),
}

/// Reflective access to the managed runtime.
///
/// Classes returned by `find_class` are local; the binding loader pins them with
/// `new_global_ref` and releases them with `delete_global_ref`. Objects returned by the
/// `new_*` calls are local references owned by the caller until `delete_local_ref`.
pub trait ManagedRuntime {
    type Class: Clone;
    type Ctor: Copy;
    type Object;

    fn find_class(&mut self, name: &str) -> Option<Self::Class>;

    fn get_constructor(&mut self, class: &Self::Class, signature: &str) -> Option<Self::Ctor>;

    fn new_global_ref(&mut self, class: &Self::Class) -> Self::Class;

    fn delete_global_ref(&mut self, class: Self::Class);

    fn new_string(&mut self, text: &str) -> Result<Self::Object, ManagedError>;

    fn new_byte_array(&mut self, bytes: &[u8]) -> Result<Self::Object, ManagedError>;

    fn new_object(
        &mut self,
        class: &Self::Class,
        ctor: Self::Ctor,
        args: &[Arg<'_, Self::Object>],
    ) -> Result<Self::Object, ManagedError>;

    fn delete_local_ref(&mut self, object: Self::Object) {
        drop(object);
    }
}
