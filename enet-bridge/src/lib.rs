//! Bridge between a managed runtime and a reliable-UDP transport engine.
//! Synchronous and caller-driven: no threads; every call runs on the caller's thread and only
//! `Bridge::service` blocks, bounded by its timeout.

pub mod address;
pub mod bindings;
pub mod bridge;
pub mod dispatch;
pub mod engine;
pub mod ffi;
pub mod handle;
pub mod managed;
pub mod marshal;
pub mod model;
pub mod runtime;

pub use address::{DecodeOrigin, DecodedHost, NativeAddress};
pub use bindings::{BindingError, Bindings};
pub use bridge::{Bridge, BridgeError};
pub use dispatch::{poll_event, EventDispatcher};
pub use engine::datagram::DatagramEngine;
pub use engine::{Engine, EngineError, EngineHost, HostSettings, NativePacket, PacketLedger, PeerId};
pub use managed::{Arg, ManagedError, ManagedRuntime};
pub use model::{packet_flags, Address, Event, EventType, Packet, Peer};
pub use runtime::{ModelRuntime, Value};
