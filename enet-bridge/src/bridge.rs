//! Lifecycle controller: the boundary entry points.
//!
//! Every entry point is a thin wrapper over a `Result`-returning helper; errors are logged and
//! collapsed to the boundary sentinels (handle 0, status -1, no event). Handles index generation
//! checked tables, so stale or foreign handles are reported and ignored rather than dereferenced.
//!
//! A `Bridge` is driven from one thread at a time (`&mut self`); callers that poll on one thread
//! and send from another share it behind a lock.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{self, AddressError, NativeAddress};
use crate::bindings::{BindingError, Bindings};
use crate::engine::{Engine, EngineError, EngineHost, HostSettings, PeerId, RawEvent};
use crate::handle::HandleTable;
use crate::managed::ManagedRuntime;
use crate::marshal::{marshal_event, EventRecord, MarshalError, PacketRecord, PeerRecord};
use crate::model::{Address, EventType};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge not initialized")]
    NotInitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unknown or destroyed host handle {0}")]
    UnknownHost(i64),
    #[error("unknown or stale peer handle {0}")]
    UnknownPeer(i64),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

struct HostEntry<H> {
    host: H,
    /// Engine peer slot -> bridge peer handle.
    peers: HashMap<PeerId, i64>,
}

struct PeerEntry {
    host: i64,
    peer: PeerId,
}

pub struct Bridge<E: Engine, R: ManagedRuntime> {
    engine: E,
    runtime: R,
    bindings: Bindings<R>,
    initialized: bool,
    hosts: HandleTable<HostEntry<E::Host>>,
    peers: HandleTable<PeerEntry>,
}

fn port_arg(port: i32) -> Result<u16, BridgeError> {
    u16::try_from(port).map_err(|_| BridgeError::InvalidArgument("port out of range"))
}

fn host_settings(
    max_peers: i32,
    max_channels: i32,
    incoming_bandwidth: i32,
    outgoing_bandwidth: i32,
) -> Result<HostSettings, BridgeError> {
    let peer_limit = usize::try_from(max_peers)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(BridgeError::InvalidArgument("peer limit must be positive"))?;
    Ok(HostSettings {
        peer_limit,
        channel_limit: usize::try_from(max_channels).unwrap_or(0),
        incoming_bandwidth: u32::try_from(incoming_bandwidth).unwrap_or(0),
        outgoing_bandwidth: u32::try_from(outgoing_bandwidth).unwrap_or(0),
    })
}

/// Wildcard for null or a wildcard literal; otherwise resolve.
fn bind_address(host: Option<&str>, port: u16) -> Result<NativeAddress, AddressError> {
    match host {
        None => Ok(NativeAddress::any(port)),
        Some(h) => address::encode_with_port(h, port),
    }
}

impl<E: Engine, R: ManagedRuntime> Bridge<E, R> {
    /// Module attach: load the managed bindings. Fails without side effects if any is missing.
    pub fn attach(engine: E, mut runtime: R) -> Result<Self, BindingError> {
        let bindings = Bindings::load(&mut runtime)?;
        Ok(Self {
            engine,
            runtime,
            bindings,
            initialized: false,
            hosts: HandleTable::new(),
            peers: HandleTable::new(),
        })
    }

    /// Module detach: tear down the engine if still up and release the bindings.
    pub fn detach(mut self) -> R {
        if self.initialized {
            self.deinitialize();
        }
        self.bindings.unload(&mut self.runtime);
        self.runtime
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn live_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn live_peers(&self) -> usize {
        self.peers.len()
    }

    /// Returns 0 on success.
    pub fn initialize(&mut self) -> i32 {
        if self.initialized {
            return 0;
        }
        match self.engine.initialize() {
            Ok(()) => {
                self.initialized = true;
                info!("transport engine initialized");
                0
            }
            Err(e) => {
                warn!("engine initialize failed: {}", e);
                -1
            }
        }
    }

    /// Hosts still alive are destroyed first; their handles go stale.
    pub fn deinitialize(&mut self) {
        if !self.initialized {
            return;
        }
        let leftover = self.hosts.drain();
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "deinitialize with live hosts, destroying them");
        }
        for (handle, entry) in leftover {
            self.forget_peers(&entry);
            debug!(handle, "host destroyed");
        }
        self.engine.deinitialize();
        self.initialized = false;
        info!("transport engine deinitialized");
    }

    /// Server-style host. `host` null, empty, `0.0.0.0` or `::` binds all interfaces.
    /// Returns 0 on failure.
    pub fn create_host(
        &mut self,
        host: Option<&str>,
        port: i32,
        max_clients: i32,
        max_channels: i32,
        incoming_bandwidth: i32,
        outgoing_bandwidth: i32,
    ) -> i64 {
        let result = port_arg(port)
            .and_then(|p| bind_address(host, p).map_err(BridgeError::from))
            .and_then(|bind| {
                let settings = host_settings(
                    max_clients,
                    max_channels,
                    incoming_bandwidth,
                    outgoing_bandwidth,
                )?;
                self.open_host(bind, &settings)
            });
        self.collapse_handle("create_host", result)
    }

    /// Client-style host: null host or port 0 binds all interfaces on an ephemeral port.
    /// Returns 0 on failure.
    pub fn create_host_bound(
        &mut self,
        host: Option<&str>,
        port: i32,
        max_peers: i32,
        max_channels: i32,
        incoming_bandwidth: i32,
        outgoing_bandwidth: i32,
    ) -> i64 {
        let bind = match (host, port) {
            (Some(h), p) if p != 0 => {
                port_arg(p).and_then(|p| bind_address(Some(h), p).map_err(BridgeError::from))
            }
            _ => Ok(NativeAddress::any(0)),
        };
        let result = bind.and_then(|bind| {
            let settings = host_settings(
                max_peers,
                max_channels,
                incoming_bandwidth,
                outgoing_bandwidth,
            )?;
            self.open_host(bind, &settings)
        });
        self.collapse_handle("create_host_bound", result)
    }

    /// Start a handshake. Returns the peer handle, or 0; completion arrives as a connect event.
    pub fn connect(
        &mut self,
        host_handle: i64,
        host: &str,
        port: i32,
        channel_count: i32,
        data: i32,
    ) -> i64 {
        let result = self.try_connect(host_handle, host, port, channel_count, data);
        self.collapse_handle("connect", result)
    }

    /// Wait up to `timeout_millis` (0 = poll) for one event.
    pub fn service(&mut self, host_handle: i64, timeout_millis: i32) -> Option<R::Object> {
        match self.try_service(host_handle, timeout_millis) {
            Ok(event) => event,
            Err(e) => {
                warn!(host_handle, "service failed: {}", e);
                None
            }
        }
    }

    /// Copy `data` into a native packet and queue it. 0 on success, -1 on failure (the packet is
    /// destroyed here).
    pub fn send(
        &mut self,
        host_handle: i64,
        peer_handle: i64,
        channel_id: i8,
        data: &[u8],
        flags: i32,
    ) -> i32 {
        match self.try_send(host_handle, peer_handle, channel_id, data, flags) {
            Ok(()) => 0,
            Err(e) => {
                warn!(host_handle, peer_handle, "send failed: {}", e);
                -1
            }
        }
    }

    /// Queue `data` to every connected peer of the host. No per-peer status.
    pub fn broadcast(&mut self, host_handle: i64, channel_id: i8, data: &[u8], flags: i32) {
        let Some(entry) = self.hosts.get_mut(host_handle) else {
            warn!(host_handle, "broadcast on unknown host");
            return;
        };
        let packet = self.engine.create_packet(data, flags as u32);
        entry.host.broadcast(channel_id as u8, packet);
    }

    pub fn flush(&mut self, host_handle: i64) {
        match self.hosts.get_mut(host_handle) {
            Some(entry) => entry.host.flush(),
            None => warn!(host_handle, "flush on unknown host"),
        }
    }

    /// Request a graceful disconnect. Completion arrives later as a disconnect event.
    pub fn disconnect_peer(&mut self, host_handle: i64, peer_handle: i64, data: i32) {
        if let Err(e) = self.try_disconnect_peer(host_handle, peer_handle, data) {
            warn!(host_handle, peer_handle, "disconnect failed: {}", e);
        }
    }

    /// Destroy the host and all its peers. 0 is a no-op; a stale handle is logged and ignored.
    pub fn destroy(&mut self, host_handle: i64) {
        if host_handle == 0 {
            return;
        }
        match self.hosts.remove(host_handle) {
            Some(entry) => {
                self.forget_peers(&entry);
                drop(entry);
                info!(host_handle, "host destroyed");
            }
            None => debug!(host_handle, "destroy of unknown or already destroyed host"),
        }
    }

    /// Local endpoint a host is bound to.
    pub fn host_address(&self, host_handle: i64) -> Option<Address> {
        let entry = self.hosts.get(host_handle)?;
        entry.host.local_address().map(|a| address::decode(&a))
    }

    /// Current remote endpoint of a peer.
    pub fn peer_address(&self, peer_handle: i64) -> Option<Address> {
        let pe = self.peers.get(peer_handle)?;
        let entry = self.hosts.get(pe.host)?;
        entry.host.peer_address(pe.peer).map(|a| address::decode(&a))
    }

    fn collapse_handle(&self, op: &'static str, result: Result<i64, BridgeError>) -> i64 {
        result.unwrap_or_else(|e| {
            warn!("{} failed: {}", op, e);
            0
        })
    }

    fn open_host(
        &mut self,
        bind: NativeAddress,
        settings: &HostSettings,
    ) -> Result<i64, BridgeError> {
        if !self.initialized {
            return Err(BridgeError::NotInitialized);
        }
        let host = self.engine.create_host(bind, settings)?;
        let handle = self.hosts.insert(HostEntry {
            host,
            peers: HashMap::new(),
        });
        info!(
            handle,
            bind = %address::decode(&bind),
            peers = settings.peer_limit,
            "host created"
        );
        Ok(handle)
    }

    fn forget_peers(&mut self, entry: &HostEntry<E::Host>) {
        for handle in entry.peers.values() {
            self.peers.remove(*handle);
        }
    }

    fn peer_handle_for(&mut self, host_handle: i64, peer: PeerId) -> Result<i64, BridgeError> {
        let entry = self
            .hosts
            .get_mut(host_handle)
            .ok_or(BridgeError::UnknownHost(host_handle))?;
        if let Some(&h) = entry.peers.get(&peer) {
            return Ok(h);
        }
        let handle = self.peers.insert(PeerEntry {
            host: host_handle,
            peer,
        });
        entry.peers.insert(peer, handle);
        Ok(handle)
    }

    fn release_peer(&mut self, host_handle: i64, peer: PeerId) {
        if let Some(entry) = self.hosts.get_mut(host_handle) {
            if let Some(handle) = entry.peers.remove(&peer) {
                self.peers.remove(handle);
            }
        }
    }

    fn resolve_peer(&self, host_handle: i64, peer_handle: i64) -> Result<PeerId, BridgeError> {
        let pe = self
            .peers
            .get(peer_handle)
            .ok_or(BridgeError::UnknownPeer(peer_handle))?;
        if pe.host != host_handle {
            return Err(BridgeError::UnknownPeer(peer_handle));
        }
        Ok(pe.peer)
    }

    fn try_connect(
        &mut self,
        host_handle: i64,
        host: &str,
        port: i32,
        channel_count: i32,
        data: i32,
    ) -> Result<i64, BridgeError> {
        let remote = address::encode_with_port(host, port_arg(port)?)?;
        let entry = self
            .hosts
            .get_mut(host_handle)
            .ok_or(BridgeError::UnknownHost(host_handle))?;
        let channels = usize::try_from(channel_count).unwrap_or(1).max(1);
        let peer = entry.host.connect(remote, channels, data as u32)?;
        debug!(host_handle, remote = %address::decode(&remote), "connecting");
        self.peer_handle_for(host_handle, peer)
    }

    fn try_service(
        &mut self,
        host_handle: i64,
        timeout_millis: i32,
    ) -> Result<Option<R::Object>, BridgeError> {
        let timeout = Duration::from_millis(u64::try_from(timeout_millis).unwrap_or(0));
        let entry = self
            .hosts
            .get_mut(host_handle)
            .ok_or(BridgeError::UnknownHost(host_handle))?;
        let Some(raw) = entry.host.service(timeout)? else {
            return Ok(None);
        };
        let object = self.marshal(host_handle, &raw);
        if raw.kind == EventType::Disconnect {
            if let Some((peer, _)) = raw.peer {
                self.release_peer(host_handle, peer);
            }
        }
        let object = object?;
        // `raw` (and its native packet) is dropped here; the managed side holds a copy.
        Ok(Some(object))
    }

    fn marshal(&mut self, host_handle: i64, raw: &RawEvent) -> Result<R::Object, BridgeError> {
        let peer = match raw.peer {
            Some((peer, address)) => Some(PeerRecord {
                handle: self.peer_handle_for(host_handle, peer)?,
                address,
            }),
            None => None,
        };
        let record = EventRecord {
            kind: raw.kind,
            peer,
            channel_id: raw.channel_id,
            data: raw.data,
            packet: raw.packet.as_ref().map(|p| PacketRecord {
                handle: p.id() as i64,
                bytes: p.data(),
                flags: p.flags(),
            }),
        };
        Ok(marshal_event(&mut self.runtime, &self.bindings, &record)?)
    }

    fn try_send(
        &mut self,
        host_handle: i64,
        peer_handle: i64,
        channel_id: i8,
        data: &[u8],
        flags: i32,
    ) -> Result<(), BridgeError> {
        let peer = self.resolve_peer(host_handle, peer_handle)?;
        let entry = self
            .hosts
            .get_mut(host_handle)
            .ok_or(BridgeError::UnknownHost(host_handle))?;
        let packet = self.engine.create_packet(data, flags as u32);
        entry.host.send(peer, channel_id as u8, packet).map_err(|e| {
            e.packet.destroy();
            BridgeError::Engine(e.reason)
        })
    }

    fn try_disconnect_peer(
        &mut self,
        host_handle: i64,
        peer_handle: i64,
        data: i32,
    ) -> Result<(), BridgeError> {
        let pe = self
            .peers
            .get(peer_handle)
            .ok_or(BridgeError::UnknownPeer(peer_handle))?;
        if host_handle != 0 && pe.host != host_handle {
            return Err(BridgeError::UnknownPeer(peer_handle));
        }
        let (owner, peer) = (pe.host, pe.peer);
        let entry = self
            .hosts
            .get_mut(owner)
            .ok_or(BridgeError::UnknownHost(owner))?;
        entry.host.disconnect(peer, data as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::datagram::DatagramEngine;
    use crate::engine::wire::MAX_PAYLOAD_LEN;
    use crate::managed::PEER_CLASS;
    use crate::model::{packet_flags, Event};
    use crate::runtime::ModelRuntime;
    use std::time::Instant;

    type TestBridge = Bridge<DatagramEngine, ModelRuntime>;

    fn bridge() -> TestBridge {
        let engine = DatagramEngine::new().with_connect_timeout(Duration::from_millis(600));
        let mut b = Bridge::attach(engine, ModelRuntime::new()).unwrap();
        assert_eq!(b.initialize(), 0);
        b
    }

    fn count(events: &[Event], kind: EventType) -> usize {
        events.iter().filter(|e| e.event_type() == kind).count()
    }

    /// Service both hosts in turn, collecting their events, until `done` holds.
    fn pump(
        b: &mut TestBridge,
        first: i64,
        second: i64,
        mut done: impl FnMut(&[Event], &[Event]) -> bool,
    ) -> (Vec<Event>, Vec<Event>) {
        let (mut a, mut c) = (Vec::new(), Vec::new());
        for _ in 0..400 {
            if let Some(obj) = b.service(first, 2) {
                a.push(obj.into_event().unwrap());
            }
            if let Some(obj) = b.service(second, 2) {
                c.push(obj.into_event().unwrap());
            }
            if done(&a, &c) {
                break;
            }
        }
        (a, c)
    }

    /// Server on loopback (one peer slot) and a connected client.
    /// Returns (server, client, server-side peer handle, client-side peer handle).
    fn connected_pair(b: &mut TestBridge) -> (i64, i64, i64, i64) {
        let server = b.create_host(Some("127.0.0.1"), 0, 1, 2, 0, 0);
        let client = b.create_host_bound(None, 0, 1, 2, 0, 0);
        assert!(server != 0 && client != 0);
        let port = b.host_address(server).unwrap().port;
        let peer = b.connect(client, "127.0.0.1", port, 2, 0);
        assert_ne!(peer, 0);
        let (s, c) = pump(b, server, client, |s, c| {
            count(s, EventType::Connect) == 1 && count(c, EventType::Connect) == 1
        });
        let remote = s[0].peer.as_ref().unwrap().handle;
        assert_eq!(c[0].peer.as_ref().unwrap().handle, peer);
        (server, client, remote, peer)
    }

    #[test]
    fn wildcard_literals_bind_any_interface() {
        let mut b = bridge();
        for host in [Some("0.0.0.0"), Some("::"), Some(""), None] {
            let h = b.create_host(host, 0, 4, 2, 0, 0);
            assert_ne!(h, 0, "bind {:?}", host);
            let bound = b.host_address(h).unwrap();
            assert!(address::is_wildcard(&bound.host), "{:?} bound {}", host, bound);
            b.destroy(h);
        }
    }

    #[test]
    fn connect_yields_one_connect_event_on_each_side() {
        let mut b = bridge();
        let server = b.create_host(Some("127.0.0.1"), 0, 1, 2, 0, 0);
        let client = b.create_host_bound(None, 0, 1, 2, 0, 0);
        let server_port = b.host_address(server).unwrap().port;
        let client_port = b.host_address(client).unwrap().port;
        let peer = b.connect(client, "127.0.0.1", server_port, 2, 7);

        let (s, c) = pump(&mut b, server, client, |s, c| {
            count(s, EventType::Connect) == 1 && count(c, EventType::Connect) == 1
        });
        // A little more servicing must not surface duplicates.
        let (s2, c2) = pump(&mut b, server, client, |_, _| false);
        assert_eq!(count(&s, EventType::Connect) + count(&s2, EventType::Connect), 1);
        assert_eq!(count(&c, EventType::Connect) + count(&c2, EventType::Connect), 1);

        let seen_by_server = s[0].peer.as_ref().unwrap();
        assert_eq!(seen_by_server.address, Address::new("127.0.0.1", client_port));
        assert_eq!(s[0].data, 7);
        let seen_by_client = c[0].peer.as_ref().unwrap();
        assert_eq!(seen_by_client.handle, peer);
        assert_eq!(seen_by_client.address, Address::new("127.0.0.1", server_port));
        assert_eq!(b.peer_address(peer), Some(Address::new("127.0.0.1", server_port)));
        assert_eq!(b.live_peers(), 2);
    }

    #[test]
    fn empty_and_binary_payloads_arrive_intact() {
        let mut b = bridge();
        let (server, client, _, peer) = connected_pair(&mut b);
        assert_eq!(b.send(client, peer, 0, b"", packet_flags::RELIABLE), 0);
        assert_eq!(
            b.send(client, peer, 1, b"hi\0there", packet_flags::UNSEQUENCED),
            0
        );
        b.flush(client);
        let (s, _) = pump(&mut b, server, client, |s, _| {
            count(s, EventType::Receive) == 2
        });
        let got: Vec<&Event> = s
            .iter()
            .filter(|e| e.event_type() == EventType::Receive)
            .collect();
        assert_eq!(got.len(), 2);
        let empty = got.iter().find(|e| e.channel_id == 0).unwrap();
        let text = got.iter().find(|e| e.channel_id == 1).unwrap();
        assert!(empty.packet.as_ref().unwrap().data.is_empty());
        assert_eq!(empty.packet.as_ref().unwrap().flags, packet_flags::RELIABLE);
        let packet = text.packet.as_ref().unwrap();
        assert_eq!(packet.data, b"hi\0there");
        assert_eq!(packet.flags, packet_flags::UNSEQUENCED);
        assert_eq!(packet.data_as_string(), "hi");
        assert_eq!(b.engine().ledger().live(), 0);
    }

    #[test]
    fn large_payloads_arrive_or_fail_without_leak() {
        let mut b = bridge();
        let (server, client, _, peer) = connected_pair(&mut b);
        let largest = vec![0x5A; MAX_PAYLOAD_LEN];
        assert_eq!(b.send(client, peer, 0, &largest, packet_flags::RELIABLE), 0);
        b.flush(client);
        let (s, _) = pump(&mut b, server, client, |s, _| {
            count(s, EventType::Receive) == 1
        });
        let received = s
            .iter()
            .find(|e| e.event_type() == EventType::Receive)
            .unwrap();
        assert_eq!(received.packet.as_ref().unwrap().data, largest);

        let too_big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(b.send(client, peer, 0, &too_big, packet_flags::RELIABLE), -1);
        assert_eq!(b.engine().ledger().live(), 0);
    }

    #[test]
    fn send_refusals_collapse_to_minus_one() {
        let mut b = bridge();
        let (server, client, remote, peer) = connected_pair(&mut b);
        // Channel outside the negotiated count.
        assert_eq!(b.send(client, peer, 5, b"x", 0), -1);
        // Peer handle belongs to the other host.
        assert_eq!(b.send(client, remote, 0, b"x", 0), -1);
        assert_eq!(b.send(server, peer, 0, b"x", 0), -1);
        assert_eq!(b.send(client, 12345, 0, b"x", 0), -1);
        assert_eq!(b.engine().ledger().live(), 0);
    }

    #[test]
    fn broadcast_reaches_connected_peers() {
        let mut b = bridge();
        let (server, client, _, _) = connected_pair(&mut b);
        b.broadcast(server, 0, b"to all", packet_flags::RELIABLE);
        b.flush(server);
        let (_, c) = pump(&mut b, server, client, |_, c| {
            count(c, EventType::Receive) == 1
        });
        let got = c
            .iter()
            .find(|e| e.event_type() == EventType::Receive)
            .unwrap();
        assert_eq!(got.packet.as_ref().unwrap().data_as_string(), "to all");
        b.broadcast(987, 0, b"nobody", 0);
        assert_eq!(b.engine().ledger().live(), 0);
    }

    #[test]
    fn graceful_disconnect_reaches_both_sides() {
        let mut b = bridge();
        let (server, client, _, peer) = connected_pair(&mut b);
        b.disconnect_peer(client, peer, 42);
        let (s, c) = pump(&mut b, server, client, |s, c| {
            count(s, EventType::Disconnect) == 1 && count(c, EventType::Disconnect) == 1
        });
        let remote_view = s
            .iter()
            .find(|e| e.event_type() == EventType::Disconnect)
            .unwrap();
        assert_eq!(remote_view.data, 42);
        let local_view = c
            .iter()
            .find(|e| e.event_type() == EventType::Disconnect)
            .unwrap();
        assert_eq!(local_view.peer.as_ref().unwrap().handle, peer);
        assert_eq!(local_view.data, 0);
        assert_eq!(b.live_peers(), 0);
        assert_eq!(b.send(client, peer, 0, b"late", 0), -1);
    }

    #[test]
    fn reconnect_before_servicing_disconnect_keeps_handles_apart() {
        let mut b = bridge();
        let server = b.create_host(Some("127.0.0.1"), 0, 2, 2, 0, 0);
        let client = b.create_host_bound(None, 0, 2, 2, 0, 0);
        let port = b.host_address(server).unwrap().port;
        let old = b.connect(client, "127.0.0.1", port, 2, 0);
        pump(&mut b, server, client, |s, c| {
            count(s, EventType::Connect) == 1 && count(c, EventType::Connect) == 1
        });

        b.disconnect_peer(client, old, 0);
        b.flush(client);
        let fresh = b.connect(client, "127.0.0.1", port, 2, 0);
        assert!(fresh != 0 && fresh != old);

        let gone = b.service(client, 0).unwrap().into_event().unwrap();
        assert_eq!(gone.event_type(), EventType::Disconnect);
        assert_eq!(gone.peer.as_ref().unwrap().handle, old);

        let (_, c) = pump(&mut b, server, client, |_, c| {
            count(c, EventType::Connect) == 1
        });
        let up = c
            .iter()
            .find(|e| e.event_type() == EventType::Connect)
            .unwrap();
        assert_eq!(up.peer.as_ref().unwrap().handle, fresh);
        assert_eq!(b.send(client, fresh, 0, b"again", 0), 0);
        assert_eq!(b.send(client, old, 0, b"stale", 0), -1);
    }

    #[test]
    fn failed_disconnect_marshal_still_releases_the_peer() {
        let mut b = bridge();
        let (_, client, _, peer) = connected_pair(&mut b);
        assert_eq!(b.live_peers(), 2);
        b.disconnect_peer(client, peer, 0);
        b.runtime_mut().fail_allocation_in(1);
        assert!(b.service(client, 0).is_none());
        assert_eq!(b.live_peers(), 1);
        assert_eq!(b.runtime().live_locals(), 0);
        assert_eq!(b.send(client, peer, 0, b"late", 0), -1);
    }

    #[test]
    fn service_without_events_honors_timeout() {
        let mut b = bridge();
        let h = b.create_host(Some("127.0.0.1"), 0, 1, 1, 0, 0);
        let started = Instant::now();
        assert!(b.service(h, 100).is_none());
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(90), "returned early: {:?}", took);
        assert!(took < Duration::from_millis(600), "blocked too long: {:?}", took);

        let started = Instant::now();
        assert!(b.service(h, 0).is_none());
        assert!(b.service(h, -5).is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn unresolvable_or_invalid_arguments_yield_zero() {
        let mut b = bridge();
        assert_eq!(b.create_host(Some("no-such-host.invalid"), 0, 1, 1, 0, 0), 0);
        assert_eq!(b.create_host(None, 70000, 1, 1, 0, 0), 0);
        assert_eq!(b.create_host(None, 0, 0, 1, 0, 0), 0);
        let h = b.create_host_bound(None, 0, 1, 1, 0, 0);
        assert_eq!(b.connect(h, "no-such-host.invalid", 9, 1, 0), 0);
        assert_eq!(b.connect(h, "127.0.0.1", -1, 1, 0), 0);
        assert_eq!(b.live_peers(), 0);
        assert_eq!(b.live_hosts(), 1);
    }

    #[test]
    fn destroy_is_idempotent_and_stales_handles() {
        let mut b = bridge();
        b.destroy(0);
        let (server, client, remote, peer) = connected_pair(&mut b);
        b.destroy(client);
        assert_eq!(b.live_hosts(), 1);
        assert_eq!(b.live_peers(), 1);
        b.destroy(client);
        assert!(b.service(client, 0).is_none());
        assert_eq!(b.send(client, peer, 0, b"x", 0), -1);
        assert_eq!(b.connect(client, "127.0.0.1", 9, 1, 0), 0);
        b.flush(client);
        b.disconnect_peer(client, peer, 0);
        assert!(b.host_address(client).is_none());

        // A new host may reuse the slot but never the handle.
        let fresh = b.create_host_bound(None, 0, 1, 1, 0, 0);
        assert_ne!(fresh, client);
        assert!(b.service(client, 0).is_none());

        b.destroy(server);
        assert!(b.peer_address(remote).is_none());
        assert_eq!(b.live_peers(), 0);
    }

    #[test]
    fn deinitialize_destroys_live_hosts() {
        let mut b = bridge();
        let a = b.create_host(None, 0, 2, 1, 0, 0);
        let c = b.create_host_bound(None, 0, 1, 1, 0, 0);
        b.deinitialize();
        assert!(!b.is_initialized());
        assert_eq!(b.live_hosts(), 0);
        assert!(b.service(a, 0).is_none());
        b.destroy(c);
        assert_eq!(b.create_host(None, 0, 1, 1, 0, 0), 0);
        assert_eq!(b.initialize(), 0);
        assert_ne!(b.create_host(None, 0, 1, 1, 0, 0), 0);
    }

    #[test]
    fn attach_fails_without_side_effects() {
        let runtime = ModelRuntime::new().without_class(PEER_CLASS.name);
        let err = Bridge::attach(DatagramEngine::new(), runtime).err().unwrap();
        assert!(matches!(err, BindingError::MissingClass(name) if name == PEER_CLASS.name));
    }

    #[test]
    fn detach_releases_bindings() {
        let mut b = bridge();
        assert_eq!(b.runtime().pinned_refs(), 4);
        b.create_host(None, 0, 1, 1, 0, 0);
        let runtime = b.detach();
        assert_eq!(runtime.pinned_refs(), 0);
        assert_eq!(runtime.live_locals(), 0);
    }
}
