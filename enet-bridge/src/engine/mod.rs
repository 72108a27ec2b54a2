//! Transport engine seam. The bridge drives an engine only through this lifecycle API;
//! sequencing, retransmission and congestion control belong to the engine.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::NativeAddress;
use crate::model::EventType;

pub mod datagram;
pub mod wire;

/// Engine-assigned peer slot within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub peer_limit: usize,
    pub channel_limit: usize,
    /// Bytes per second; 0 = unlimited.
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,
    #[error("invalid host settings: {0}")]
    InvalidSettings(&'static str),
    #[error("no free peer slot")]
    PeerLimit,
    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerId),
    #[error("peer {0:?} is not connected")]
    NotConnected(PeerId),
    #[error("channel {channel} out of range (peer has {count})")]
    InvalidChannel { channel: u8, count: usize },
    #[error("packet of {len} bytes exceeds {max}")]
    PacketTooLarge { len: usize, max: usize },
    #[error("address family not supported by this host: {0}")]
    AddressFamily(std::net::SocketAddr),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send refusal. The engine hands the packet back; the caller is responsible for destroying it.
#[derive(Debug)]
pub struct SendError {
    pub packet: NativePacket,
    pub reason: EngineError,
}

#[derive(Debug, Default)]
struct LedgerInner {
    next_id: AtomicU64,
    live: AtomicUsize,
}

/// Counts native packets alive across an engine and everything holding its packets.
#[derive(Debug, Clone, Default)]
pub struct PacketLedger(Arc<LedgerInner>);

impl PacketLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into a new native packet.
    pub fn create(&self, data: &[u8], flags: u32) -> NativePacket {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.0.live.fetch_add(1, Ordering::Relaxed);
        NativePacket {
            id,
            data: data.to_vec(),
            flags,
            ledger: self.clone(),
        }
    }

    pub fn live(&self) -> usize {
        self.0.live.load(Ordering::Relaxed)
    }
}

/// Native packet: a private payload copy plus delivery flags.
#[derive(Debug)]
pub struct NativePacket {
    id: u64,
    data: Vec<u8>,
    flags: u32,
    ledger: PacketLedger,
}

impl NativePacket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Release the packet now.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for NativePacket {
    fn drop(&mut self) {
        self.ledger.0.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One occurrence reported by `EngineHost::service`. The packet, if any, is owned by the record.
#[derive(Debug)]
pub struct RawEvent {
    pub kind: EventType,
    pub peer: Option<(PeerId, NativeAddress)>,
    pub channel_id: u8,
    pub data: u32,
    pub packet: Option<NativePacket>,
}

/// Global lifecycle of a transport engine.
pub trait Engine {
    type Host: EngineHost;

    fn initialize(&mut self) -> Result<(), EngineError>;

    fn deinitialize(&mut self);

    fn create_host(
        &mut self,
        bind: NativeAddress,
        settings: &HostSettings,
    ) -> Result<Self::Host, EngineError>;

    fn create_packet(&self, data: &[u8], flags: u32) -> NativePacket;
}

/// One bound local endpoint. Dropping the host destroys it and all its peers.
pub trait EngineHost {
    /// Start a handshake; completion arrives later as a connect event.
    ///
    /// A slot named by an event not yet returned from `service` is never handed to a new peer,
    /// so a `PeerId` seen in an event always refers to the peer the event is about.
    fn connect(
        &mut self,
        remote: NativeAddress,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, EngineError>;

    /// Wait up to `timeout` for one event. `Duration::ZERO` polls without blocking.
    fn service(&mut self, timeout: Duration) -> Result<Option<RawEvent>, EngineError>;

    fn send(&mut self, peer: PeerId, channel_id: u8, packet: NativePacket) -> Result<(), SendError>;

    /// Queue `packet` to every connected peer. Fire-and-forget.
    fn broadcast(&mut self, channel_id: u8, packet: NativePacket);

    fn flush(&mut self);

    /// Request a graceful disconnect; completion arrives later as a disconnect event.
    fn disconnect(&mut self, peer: PeerId, data: u32);

    fn local_address(&self) -> Option<NativeAddress>;

    fn peer_address(&self, peer: PeerId) -> Option<NativeAddress>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_counts_live_packets() {
        let ledger = PacketLedger::new();
        let a = ledger.create(b"abc", 1);
        let b = ledger.create(&[], 0);
        assert_eq!(ledger.live(), 2);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.data(), b"abc");
        assert!(b.is_empty());
        a.destroy();
        assert_eq!(ledger.live(), 1);
        drop(b);
        assert_eq!(ledger.live(), 0);
    }
}
