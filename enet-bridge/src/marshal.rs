//! Event marshaling: one native event record into one managed Event object graph.
//!
//! Order: Peer (handle + decoded Address), then Packet (handle + copied bytes + flags), then the
//! Event itself. Intermediate local references are deleted on every path; on failure nothing
//! built so far survives.

use crate::address::{self, NativeAddress};
use crate::bindings::{BindingError, Bindings};
use crate::managed::{Arg, ManagedError, ManagedRuntime};
use crate::model::EventType;

/// Peer half of an event record: bridge handle plus the engine's address snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub handle: i64,
    pub address: NativeAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketRecord<'a> {
    pub handle: i64,
    pub bytes: &'a [u8],
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EventRecord<'a> {
    pub kind: EventType,
    pub peer: Option<PeerRecord>,
    pub channel_id: u8,
    pub data: u32,
    pub packet: Option<PacketRecord<'a>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("building {what}: {source}")]
    Construct {
        what: &'static str,
        #[source]
        source: ManagedError,
    },
}

fn construct(what: &'static str) -> impl FnOnce(ManagedError) -> MarshalError {
    move |source| MarshalError::Construct { what, source }
}

fn build_address<R: ManagedRuntime>(
    rt: &mut R,
    bindings: &Bindings<R>,
    addr: &NativeAddress,
) -> Result<R::Object, MarshalError> {
    let b = &bindings.resolved()?.address;
    let decoded = address::decode(addr);
    let host = rt.new_string(&decoded.host).map_err(construct("address host"))?;
    let result = rt.new_object(
        &b.class,
        b.ctor,
        &[Arg::Object(Some(&host)), Arg::Int(decoded.port)],
    );
    rt.delete_local_ref(host);
    result.map_err(construct("address"))
}

fn build_peer<R: ManagedRuntime>(
    rt: &mut R,
    bindings: &Bindings<R>,
    peer: &PeerRecord,
) -> Result<R::Object, MarshalError> {
    let b = &bindings.resolved()?.peer;
    let address = build_address(rt, bindings, &peer.address)?;
    let result = rt.new_object(
        &b.class,
        b.ctor,
        &[Arg::Long(peer.handle), Arg::Object(Some(&address))],
    );
    rt.delete_local_ref(address);
    result.map_err(construct("peer"))
}

fn build_packet<R: ManagedRuntime>(
    rt: &mut R,
    bindings: &Bindings<R>,
    packet: &PacketRecord<'_>,
) -> Result<R::Object, MarshalError> {
    let b = &bindings.resolved()?.packet;
    let bytes = rt
        .new_byte_array(packet.bytes)
        .map_err(construct("packet data"))?;
    let result = rt.new_object(
        &b.class,
        b.ctor,
        &[
            Arg::Long(packet.handle),
            Arg::Object(Some(&bytes)),
            Arg::Int(packet.flags as i32),
        ],
    );
    rt.delete_local_ref(bytes);
    result.map_err(construct("packet"))
}

fn release<R: ManagedRuntime>(rt: &mut R, object: Option<R::Object>) {
    if let Some(o) = object {
        rt.delete_local_ref(o);
    }
}

/// Build the managed Event for `record`. The returned object is the only local reference left.
pub fn marshal_event<R: ManagedRuntime>(
    rt: &mut R,
    bindings: &Bindings<R>,
    record: &EventRecord<'_>,
) -> Result<R::Object, MarshalError> {
    let b = &bindings.resolved()?.event;
    let peer = match &record.peer {
        Some(p) => Some(build_peer(rt, bindings, p)?),
        None => None,
    };
    let packet = match &record.packet {
        Some(p) => match build_packet(rt, bindings, p) {
            Ok(obj) => Some(obj),
            Err(e) => {
                release(rt, peer);
                return Err(e);
            }
        },
        None => None,
    };
    let result = rt.new_object(
        &b.class,
        b.ctor,
        &[
            Arg::Int(record.kind.as_raw()),
            Arg::Object(peer.as_ref()),
            Arg::Byte(record.channel_id as i8),
            Arg::Int(record.data as i32),
            Arg::Object(packet.as_ref()),
        ],
    );
    release(rt, peer);
    release(rt, packet);
    result.map_err(construct("event"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{packet_flags, Address, Event, Packet, Peer};
    use crate::runtime::ModelRuntime;

    fn setup() -> (ModelRuntime, Bindings<ModelRuntime>) {
        let mut rt = ModelRuntime::new();
        let b = Bindings::load(&mut rt).unwrap();
        (rt, b)
    }

    fn receive_record(bytes: &[u8]) -> EventRecord<'_> {
        EventRecord {
            kind: EventType::Receive,
            peer: Some(PeerRecord {
                handle: 77,
                address: address::encode_with_port("127.0.0.1", 9000).unwrap(),
            }),
            channel_id: 1,
            data: 0,
            packet: Some(PacketRecord {
                handle: 5,
                bytes,
                flags: packet_flags::RELIABLE as u32,
            }),
        }
    }

    #[test]
    fn receive_event_builds_full_graph() {
        let (mut rt, b) = setup();
        let obj = marshal_event(&mut rt, &b, &receive_record(b"hi")).unwrap();
        assert_eq!(rt.live_locals(), 1, "only the event stays referenced");
        let event = obj.into_event().unwrap();
        assert_eq!(
            event,
            Event {
                kind: 3,
                peer: Some(Peer {
                    handle: 77,
                    address: Address::new("127.0.0.1", 9000),
                }),
                channel_id: 1,
                data: 0,
                packet: Some(Packet {
                    handle: 5,
                    data: b"hi".to_vec(),
                    flags: packet_flags::RELIABLE,
                }),
            }
        );
    }

    #[test]
    fn event_without_peer_or_packet() {
        let (mut rt, b) = setup();
        let record = EventRecord {
            kind: EventType::None,
            peer: None,
            channel_id: 200,
            data: u32::MAX,
            packet: None,
        };
        let event = marshal_event(&mut rt, &b, &record)
            .unwrap()
            .into_event()
            .unwrap();
        assert!(event.peer.is_none() && event.packet.is_none());
        assert_eq!(event.channel_id, 200u8 as i8);
        assert_eq!(event.data, -1);
    }

    #[test]
    fn failure_at_every_step_leaves_nothing_behind() {
        // Receive events allocate: host string, address, peer, byte array, packet, event.
        for step in 1..=6 {
            let (mut rt, b) = setup();
            rt.fail_allocation_in(step);
            let result = marshal_event(&mut rt, &b, &receive_record(b"payload"));
            assert!(result.is_err(), "step {} should fail", step);
            assert_eq!(rt.live_locals(), 0, "leak after failing step {}", step);
        }
    }

    #[test]
    fn unloaded_bindings_refuse() {
        let (mut rt, mut b) = setup();
        b.unload(&mut rt);
        let err = marshal_event(&mut rt, &b, &receive_record(b"")).unwrap_err();
        assert!(matches!(err, MarshalError::Binding(BindingError::NotLoaded)));
        assert_eq!(rt.live_locals(), 0);
    }
}
