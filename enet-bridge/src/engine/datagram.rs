//! Minimal datagram engine over `std::net::UdpSocket`.
//!
//! Provides the handshake, graceful disconnect, peer/channel limits and per-peer outgoing queues
//! the bridge needs. No sequencing, data retransmission, congestion control or fragmentation:
//! payloads travel as single datagrams and may be lost on a lossy path.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::time::{Duration, Instant};

use tracing::debug;

use super::wire::{decode_datagram, encode_datagram, Datagram, MAX_PAYLOAD_LEN};
use super::{
    Engine, EngineError, EngineHost, HostSettings, NativePacket, PacketLedger, PeerId, RawEvent,
    SendError,
};
use crate::address::NativeAddress;
use crate::model::EventType;

const CONNECT_RESEND: Duration = Duration::from_millis(250);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PEER_LIMIT: usize = 4095;
const MAX_CHANNEL_LIMIT: usize = 255;
const RECV_BUF_LEN: usize = 64 * 1024;

pub struct DatagramEngine {
    initialized: bool,
    ledger: PacketLedger,
    connect_timeout: Duration,
}

impl DatagramEngine {
    pub fn new() -> Self {
        Self {
            initialized: false,
            ledger: PacketLedger::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// How long an unanswered handshake is retried before a disconnect event is reported.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &PacketLedger {
        &self.ledger
    }
}

impl Default for DatagramEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_socket(bind: NativeAddress) -> std::io::Result<UdpSocket> {
    if bind.is_any() {
        let dual = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, bind.port, 0, 0));
        match UdpSocket::bind(dual) {
            Ok(s) => return Ok(s),
            Err(e) => debug!("dual-stack bind failed ({}), binding IPv4 only", e),
        }
        return UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            bind.port,
        )));
    }
    UdpSocket::bind(bind.to_socket_addr())
}

impl Engine for DatagramEngine {
    type Host = DatagramHost;

    fn initialize(&mut self) -> Result<(), EngineError> {
        self.initialized = true;
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.initialized = false;
    }

    fn create_host(
        &mut self,
        bind: NativeAddress,
        settings: &HostSettings,
    ) -> Result<DatagramHost, EngineError> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        if settings.peer_limit == 0 || settings.peer_limit > MAX_PEER_LIMIT {
            return Err(EngineError::InvalidSettings("peer limit out of range"));
        }
        let channel_limit = match settings.channel_limit {
            0 => MAX_CHANNEL_LIMIT,
            n => n.min(MAX_CHANNEL_LIMIT),
        };
        let socket = bind_socket(bind)?;
        let local = socket.local_addr()?;
        Ok(DatagramHost {
            socket,
            is_v6: local.is_ipv6(),
            settings: HostSettings {
                channel_limit,
                ..settings.clone()
            },
            peers: (0..settings.peer_limit).map(|_| None).collect(),
            events: VecDeque::new(),
            ledger: self.ledger.clone(),
            connect_timeout: self.connect_timeout,
            recv_buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    fn create_packet(&self, data: &[u8], flags: u32) -> NativePacket {
        self.ledger.create(data, flags)
    }
}

#[derive(Debug, Clone, Copy)]
enum PeerState {
    Connecting {
        started: Instant,
        last_attempt: Instant,
    },
    Connected,
    /// Disconnect queued; the slot is freed once it has been flushed.
    Disconnecting,
}

struct PeerSlot {
    remote: SocketAddr,
    connect_id: u32,
    connect_data: u32,
    channel_count: usize,
    state: PeerState,
    outgoing: VecDeque<Vec<u8>>,
}

pub struct DatagramHost {
    socket: UdpSocket,
    is_v6: bool,
    settings: HostSettings,
    peers: Vec<Option<PeerSlot>>,
    events: VecDeque<RawEvent>,
    ledger: PacketLedger,
    connect_timeout: Duration,
    recv_buf: Vec<u8>,
}

/// IPv4-mapped IPv6 source addresses compare as plain IPv4.
fn normalize(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, v6.port())),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

impl DatagramHost {
    pub fn settings(&self) -> &HostSettings {
        &self.settings
    }

    fn destination(&self, to: SocketAddr) -> Result<SocketAddr, EngineError> {
        match (self.is_v6, to) {
            (true, SocketAddr::V4(v4)) => Ok(SocketAddr::V6(SocketAddrV6::new(
                v4.ip().to_ipv6_mapped(),
                v4.port(),
                0,
                0,
            ))),
            (false, SocketAddr::V6(_)) => Err(EngineError::AddressFamily(to)),
            _ => Ok(to),
        }
    }

    /// First empty slot that no queued event still refers to.
    fn free_slot(&self) -> Option<usize> {
        (0..self.peers.len()).find(|&idx| {
            self.peers[idx].is_none()
                && !self
                    .events
                    .iter()
                    .any(|e| matches!(e.peer, Some((PeerId(p), _)) if p == idx))
        })
    }

    fn find_peer(&self, from: SocketAddr, connect_id: u32) -> Option<usize> {
        self.peers.iter().position(|p| {
            p.as_ref()
                .map_or(false, |s| s.remote == from && s.connect_id == connect_id)
        })
    }

    fn queue(&mut self, idx: usize, msg: &Datagram) {
        match encode_datagram(msg) {
            Ok(bytes) => {
                if let Some(slot) = self.peers[idx].as_mut() {
                    slot.outgoing.push_back(bytes);
                }
            }
            Err(e) => debug!("dropping outgoing datagram: {}", e),
        }
    }

    fn transmit(&self, to: SocketAddr, bytes: &[u8]) {
        match self.destination(to) {
            Ok(dest) => {
                if let Err(e) = self.socket.send_to(bytes, dest) {
                    debug!(%dest, "send_to failed: {}", e);
                }
            }
            Err(e) => debug!("not transmitting: {}", e),
        }
    }

    fn transmit_now(&self, to: SocketAddr, msg: &Datagram) {
        if let Ok(bytes) = encode_datagram(msg) {
            self.transmit(to, &bytes);
        }
    }

    fn push_event(
        &mut self,
        kind: EventType,
        idx: usize,
        remote: SocketAddr,
        channel_id: u8,
        data: u32,
        packet: Option<NativePacket>,
    ) {
        self.events.push_back(RawEvent {
            kind,
            peer: Some((PeerId(idx), NativeAddress::from_socket_addr(remote))),
            channel_id,
            data,
            packet,
        });
    }

    /// Resend unanswered handshakes; give up on those past the connect timeout.
    fn run_timers(&mut self, now: Instant) {
        for idx in 0..self.peers.len() {
            let (started, last_attempt, remote, connect_id, connect_data, channel_count) =
                match &self.peers[idx] {
                    Some(PeerSlot {
                        state:
                            PeerState::Connecting {
                                started,
                                last_attempt,
                            },
                        remote,
                        connect_id,
                        connect_data,
                        channel_count,
                        ..
                    }) => (
                        *started,
                        *last_attempt,
                        *remote,
                        *connect_id,
                        *connect_data,
                        *channel_count,
                    ),
                    _ => continue,
                };
            if now.duration_since(started) >= self.connect_timeout {
                self.peers[idx] = None;
                self.push_event(EventType::Disconnect, idx, remote, 0, 0, None);
            } else if now.duration_since(last_attempt) >= CONNECT_RESEND {
                if let Some(slot) = self.peers[idx].as_mut() {
                    slot.state = PeerState::Connecting {
                        started,
                        last_attempt: now,
                    };
                }
                self.queue(
                    idx,
                    &Datagram::Connect {
                        connect_id,
                        channel_count: channel_count as u8,
                        data: connect_data,
                    },
                );
            }
        }
    }

    /// Receive at most one datagram, waiting up to `wait`.
    fn receive(&mut self, wait: Duration) -> Result<(), EngineError> {
        if wait.is_zero() {
            self.socket.set_nonblocking(true)?;
        } else {
            self.socket.set_nonblocking(false)?;
            self.socket.set_read_timeout(Some(wait.min(CONNECT_RESEND)))?;
        }
        let mut buf = std::mem::take(&mut self.recv_buf);
        let outcome = match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                self.handle_datagram(normalize(from), &buf[..n]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(()),
            // ICMP port-unreachable surfaced by some platforms; nothing to deliver.
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::Interrupted) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.recv_buf = buf;
        outcome
    }

    fn handle_datagram(&mut self, from: SocketAddr, bytes: &[u8]) {
        let msg = match decode_datagram(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, "dropping datagram: {}", e);
                return;
            }
        };
        match msg {
            Datagram::Connect {
                connect_id,
                channel_count,
                data,
            } => self.on_connect(from, connect_id, channel_count, data),
            Datagram::VerifyConnect {
                connect_id,
                channel_count,
            } => self.on_verify_connect(from, connect_id, channel_count),
            Datagram::Disconnect { connect_id, data } => self.on_disconnect(from, connect_id, data),
            Datagram::Payload {
                connect_id,
                channel_id,
                flags,
                data,
            } => self.on_payload(from, connect_id, channel_id, flags, &data),
        }
    }

    fn on_connect(&mut self, from: SocketAddr, connect_id: u32, channel_count: u8, data: u32) {
        if let Some(idx) = self.find_peer(from, connect_id) {
            // Our verify was lost; answer the retry again.
            let count = match &self.peers[idx] {
                Some(PeerSlot {
                    state: PeerState::Connected,
                    channel_count,
                    ..
                }) => *channel_count,
                _ => return,
            };
            self.queue(
                idx,
                &Datagram::VerifyConnect {
                    connect_id,
                    channel_count: count as u8,
                },
            );
            return;
        }
        let Some(idx) = self.free_slot() else {
            debug!(%from, "peer limit reached, refusing connect");
            self.transmit_now(from, &Datagram::Disconnect { connect_id, data: 0 });
            return;
        };
        let channel_count = usize::from(channel_count).clamp(1, self.settings.channel_limit);
        self.peers[idx] = Some(PeerSlot {
            remote: from,
            connect_id,
            connect_data: data,
            channel_count,
            state: PeerState::Connected,
            outgoing: VecDeque::new(),
        });
        self.queue(
            idx,
            &Datagram::VerifyConnect {
                connect_id,
                channel_count: channel_count as u8,
            },
        );
        self.push_event(EventType::Connect, idx, from, 0, data, None);
    }

    fn on_verify_connect(&mut self, from: SocketAddr, connect_id: u32, channel_count: u8) {
        let Some(idx) = self.find_peer(from, connect_id) else {
            return;
        };
        let Some(slot) = self.peers[idx].as_mut() else {
            return;
        };
        if !matches!(slot.state, PeerState::Connecting { .. }) {
            return;
        }
        slot.state = PeerState::Connected;
        slot.channel_count = slot.channel_count.min(usize::from(channel_count)).max(1);
        self.push_event(EventType::Connect, idx, from, 0, 0, None);
    }

    fn on_disconnect(&mut self, from: SocketAddr, connect_id: u32, data: u32) {
        let Some(idx) = self.find_peer(from, connect_id) else {
            return;
        };
        if matches!(
            self.peers[idx].as_ref().map(|s| s.state),
            Some(PeerState::Disconnecting)
        ) {
            return;
        }
        self.peers[idx] = None;
        self.push_event(EventType::Disconnect, idx, from, 0, data, None);
    }

    fn on_payload(
        &mut self,
        from: SocketAddr,
        connect_id: u32,
        channel_id: u8,
        flags: u32,
        data: &[u8],
    ) {
        let Some(idx) = self.find_peer(from, connect_id) else {
            debug!(%from, "payload from unknown peer");
            return;
        };
        let accepted = matches!(
            &self.peers[idx],
            Some(PeerSlot { state: PeerState::Connected, channel_count, .. })
                if usize::from(channel_id) < *channel_count
        );
        if !accepted {
            debug!(%from, channel_id, "payload dropped");
            return;
        }
        let packet = self.ledger.create(data, flags);
        self.push_event(EventType::Receive, idx, from, channel_id, 0, Some(packet));
    }
}

impl EngineHost for DatagramHost {
    fn connect(
        &mut self,
        remote: NativeAddress,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, EngineError> {
        let remote = normalize(remote.to_socket_addr());
        self.destination(remote)?;
        let idx = self.free_slot().ok_or(EngineError::PeerLimit)?;
        let channel_count = channel_count.clamp(1, self.settings.channel_limit);
        let connect_id: u32 = rand::random();
        let now = Instant::now();
        self.peers[idx] = Some(PeerSlot {
            remote,
            connect_id,
            connect_data: data,
            channel_count,
            state: PeerState::Connecting {
                started: now,
                last_attempt: now,
            },
            outgoing: VecDeque::new(),
        });
        self.queue(
            idx,
            &Datagram::Connect {
                connect_id,
                channel_count: channel_count as u8,
                data,
            },
        );
        Ok(PeerId(idx))
    }

    fn service(&mut self, timeout: Duration) -> Result<Option<RawEvent>, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_timers(Instant::now());
            self.flush();
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.receive(remaining)?;
            if remaining.is_zero() {
                return Ok(self.events.pop_front());
            }
        }
    }

    fn send(&mut self, peer: PeerId, channel_id: u8, packet: NativePacket) -> Result<(), SendError> {
        let check = match self.peers.get(peer.0).and_then(Option::as_ref) {
            None => Err(EngineError::UnknownPeer(peer)),
            Some(slot) if !matches!(slot.state, PeerState::Connected) => {
                Err(EngineError::NotConnected(peer))
            }
            Some(slot) if usize::from(channel_id) >= slot.channel_count => {
                Err(EngineError::InvalidChannel {
                    channel: channel_id,
                    count: slot.channel_count,
                })
            }
            Some(_) if packet.len() > MAX_PAYLOAD_LEN => Err(EngineError::PacketTooLarge {
                len: packet.len(),
                max: MAX_PAYLOAD_LEN,
            }),
            Some(slot) => Ok(slot.connect_id),
        };
        let connect_id = match check {
            Ok(id) => id,
            Err(reason) => return Err(SendError { packet, reason }),
        };
        self.queue(
            peer.0,
            &Datagram::Payload {
                connect_id,
                channel_id,
                flags: packet.flags(),
                data: packet.data().to_vec(),
            },
        );
        Ok(())
    }

    fn broadcast(&mut self, channel_id: u8, packet: NativePacket) {
        if packet.len() > MAX_PAYLOAD_LEN {
            debug!(len = packet.len(), "broadcast packet too large, dropped");
            return;
        }
        for idx in 0..self.peers.len() {
            let connect_id = match &self.peers[idx] {
                Some(PeerSlot {
                    state: PeerState::Connected,
                    channel_count,
                    connect_id,
                    ..
                }) if usize::from(channel_id) < *channel_count => *connect_id,
                _ => continue,
            };
            self.queue(
                idx,
                &Datagram::Payload {
                    connect_id,
                    channel_id,
                    flags: packet.flags(),
                    data: packet.data().to_vec(),
                },
            );
        }
    }

    fn flush(&mut self) {
        for idx in 0..self.peers.len() {
            let Some(slot) = self.peers[idx].as_mut() else {
                continue;
            };
            let remote = slot.remote;
            let leaving = matches!(slot.state, PeerState::Disconnecting);
            let pending: Vec<Vec<u8>> = slot.outgoing.drain(..).collect();
            for bytes in &pending {
                self.transmit(remote, bytes);
            }
            if leaving {
                self.peers[idx] = None;
            }
        }
    }

    fn disconnect(&mut self, peer: PeerId, data: u32) {
        let Some(slot) = self.peers.get_mut(peer.0).and_then(Option::as_mut) else {
            return;
        };
        if matches!(slot.state, PeerState::Disconnecting) {
            return;
        }
        let remote = slot.remote;
        let connect_id = slot.connect_id;
        slot.state = PeerState::Disconnecting;
        slot.outgoing.clear();
        self.queue(peer.0, &Datagram::Disconnect { connect_id, data });
        self.push_event(EventType::Disconnect, peer.0, remote, 0, 0, None);
    }

    fn local_address(&self) -> Option<NativeAddress> {
        self.socket
            .local_addr()
            .ok()
            .map(NativeAddress::from_socket_addr)
    }

    fn peer_address(&self, peer: PeerId) -> Option<NativeAddress> {
        self.peers
            .get(peer.0)
            .and_then(Option::as_ref)
            .map(|s| NativeAddress::from_socket_addr(s.remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(peer_limit: usize) -> HostSettings {
        HostSettings {
            peer_limit,
            channel_limit: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }

    fn loopback(port: u16) -> NativeAddress {
        NativeAddress::from_socket_addr(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn engine() -> DatagramEngine {
        let mut e = DatagramEngine::new().with_connect_timeout(Duration::from_millis(600));
        e.initialize().unwrap();
        e
    }

    /// Service both hosts until `target` reports an event of `kind`.
    fn collect(
        target: &mut DatagramHost,
        other: &mut DatagramHost,
        kind: EventType,
    ) -> Option<RawEvent> {
        for _ in 0..200 {
            if let Some(ev) = target.service(Duration::from_millis(5)).unwrap() {
                if ev.kind == kind {
                    return Some(ev);
                }
            }
            let _ = other.service(Duration::ZERO).unwrap();
        }
        None
    }

    #[test]
    fn create_host_requires_initialize() {
        let mut e = DatagramEngine::new();
        assert!(matches!(
            e.create_host(loopback(0), &settings(1)),
            Err(EngineError::NotInitialized)
        ));
        e.initialize().unwrap();
        assert!(matches!(
            e.create_host(loopback(0), &settings(0)),
            Err(EngineError::InvalidSettings(_))
        ));
        assert!(e.create_host(loopback(0), &settings(1)).is_ok());
    }

    #[test]
    fn handshake_and_payload() {
        let mut e = engine();
        let mut server = e.create_host(loopback(0), &settings(4)).unwrap();
        let mut client = e.create_host(NativeAddress::any(0), &settings(1)).unwrap();
        let server_addr = server.local_address().unwrap();

        let pid = client.connect(server_addr, 2, 42).unwrap();
        let accepted = collect(&mut server, &mut client, EventType::Connect).unwrap();
        assert_eq!(accepted.data, 42);
        let connected = collect(&mut client, &mut server, EventType::Connect).unwrap();
        assert_eq!(connected.peer.unwrap().0, pid);
        assert_eq!(connected.peer.unwrap().1, server_addr);

        let packet = e.create_packet(b"ping", 1);
        client.send(pid, 1, packet).unwrap();
        client.flush();
        let got = collect(&mut server, &mut client, EventType::Receive).unwrap();
        let p = got.packet.as_ref().unwrap();
        assert_eq!(p.data(), b"ping");
        assert_eq!(p.flags(), 1);
        assert_eq!(got.channel_id, 1);
        drop(got);
        assert_eq!(e.ledger().live(), 0);
    }

    #[test]
    fn send_refusals_return_the_packet() {
        let mut e = engine();
        let mut client = e.create_host(loopback(0), &settings(1)).unwrap();
        let pid = client.connect(loopback(9), 1, 0).unwrap();
        let err = client.send(pid, 0, e.create_packet(b"x", 0)).unwrap_err();
        assert!(matches!(err.reason, EngineError::NotConnected(_)));
        assert_eq!(e.ledger().live(), 1);
        err.packet.destroy();
        assert_eq!(e.ledger().live(), 0);
        let err = client
            .send(PeerId(7), 0, e.create_packet(b"x", 0))
            .unwrap_err();
        assert!(matches!(err.reason, EngineError::UnknownPeer(_)));
    }

    #[test]
    fn full_server_refuses_connect() {
        let mut e = engine();
        let mut server = e.create_host(loopback(0), &settings(1)).unwrap();
        let mut first = e.create_host(loopback(0), &settings(1)).unwrap();
        let mut second = e.create_host(loopback(0), &settings(1)).unwrap();
        let addr = server.local_address().unwrap();
        first.connect(addr, 1, 0).unwrap();
        assert!(collect(&mut server, &mut first, EventType::Connect).is_some());
        second.connect(addr, 1, 0).unwrap();
        let refused = collect(&mut second, &mut server, EventType::Disconnect);
        assert!(refused.is_some());
    }

    #[test]
    fn unanswered_connect_times_out() {
        let mut e = engine();
        let mut client = e.create_host(loopback(0), &settings(1)).unwrap();
        // Bound but never serviced: handshakes go unanswered.
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = NativeAddress::from_socket_addr(silent.local_addr().unwrap());
        client.connect(target, 1, 0).unwrap();
        let started = Instant::now();
        let mut event = None;
        while started.elapsed() < Duration::from_secs(3) && event.is_none() {
            event = client.service(Duration::from_millis(50)).unwrap();
        }
        let event = event.unwrap();
        assert_eq!(event.kind, EventType::Disconnect);
        assert_eq!(client.free_slot(), Some(0));
    }

    #[test]
    fn service_without_events_honors_timeout() {
        let mut e = engine();
        let mut host = e.create_host(loopback(0), &settings(1)).unwrap();
        let started = Instant::now();
        assert!(host.service(Duration::from_millis(100)).unwrap().is_none());
        let took = started.elapsed();
        assert!(took >= Duration::from_millis(90), "returned early: {:?}", took);
        assert!(took < Duration::from_millis(600), "blocked too long: {:?}", took);
        assert!(host.service(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn freed_slot_is_not_reused_while_its_disconnect_is_queued() {
        let mut e = engine();
        let mut server = e.create_host(loopback(0), &settings(2)).unwrap();
        let mut client = e.create_host(loopback(0), &settings(2)).unwrap();
        let addr = server.local_address().unwrap();
        let first = client.connect(addr, 1, 0).unwrap();
        assert!(collect(&mut client, &mut server, EventType::Connect).is_some());

        client.disconnect(first, 0);
        client.flush();
        let second = client.connect(addr, 1, 0).unwrap();
        assert_ne!(second, first);

        let ev = client.service(Duration::ZERO).unwrap().unwrap();
        assert_eq!(ev.kind, EventType::Disconnect);
        assert_eq!(ev.peer.unwrap().0, first);
        let connected = collect(&mut client, &mut server, EventType::Connect).unwrap();
        assert_eq!(connected.peer.unwrap().0, second);

        // Once the disconnect is delivered, the old slot is free again.
        let third = client.connect(addr, 1, 0).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn junk_traffic_does_not_stretch_the_timeout() {
        let mut e = engine();
        let mut host = e.create_host(loopback(0), &settings(1)).unwrap();
        let target = host.local_address().unwrap().to_socket_addr();
        let flooder = std::thread::spawn(move || {
            let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
            let until = Instant::now() + Duration::from_millis(800);
            while Instant::now() < until {
                let _ = sock.send_to(&[0xFF; 8], target);
            }
        });
        let started = Instant::now();
        assert!(host.service(Duration::from_millis(100)).unwrap().is_none());
        let took = started.elapsed();
        flooder.join().unwrap();
        assert!(took < Duration::from_millis(500), "blocked too long: {:?}", took);
    }
}
