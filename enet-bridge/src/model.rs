//! Managed data carriers: the values `Bridge::service` hands back through `ModelRuntime`.

use std::fmt;

/// Event kinds surfaced by polling a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    None = 0,
    Connect = 1,
    Disconnect = 2,
    Receive = 3,
}

impl EventType {
    /// Map a raw boundary value; unknown values read as `None`.
    pub fn from_raw(value: i32) -> Self {
        match value {
            1 => EventType::Connect,
            2 => EventType::Disconnect,
            3 => EventType::Receive,
            _ => EventType::None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Packet delivery-mode flags as carried across the boundary.
pub mod packet_flags {
    pub const RELIABLE: i32 = 1;
    pub const UNSEQUENCED: i32 = 2;
    pub const NO_ALLOCATE: i32 = 4;
    pub const UNRELIABLE_FRAGMENT: i32 = 8;
    pub const UNTHROTTLED: i32 = 16;
}

/// Remote or local endpoint as seen by the managed side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: i32,
}

impl Address {
    pub fn new(host: impl Into<String>, port: i32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One remote connection: opaque handle plus an address snapshot taken at marshaling time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub handle: i64,
    pub address: Address,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer{{address={}}}", self.address)
    }
}

/// Received payload. `data` is a private copy; `handle` is informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub handle: i64,
    pub data: Vec<u8>,
    pub flags: i32,
}

impl Packet {
    /// Payload as UTF-8 text, cut at the first NUL byte (C-style strings from native peers).
    pub fn data_as_string(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

/// One occurrence surfaced by `Bridge::service`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: i32,
    pub peer: Option<Peer>,
    pub channel_id: i8,
    pub data: i32,
    pub packet: Option<Packet>,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        EventType::from_raw(self.kind)
    }
}
