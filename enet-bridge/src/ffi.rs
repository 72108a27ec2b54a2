//! C ABI for hosts that drive the bridge from C/C++ (or from a JNI shim written in C).
//! The context returned by `enet_bridge_attach` owns one bridge over the datagram engine.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::slice;

use crate::bridge::Bridge;
use crate::engine::datagram::DatagramEngine;
use crate::managed::ManagedRuntime;
use crate::model::Event;
use crate::runtime::ModelRuntime;

type Context = Bridge<DatagramEngine, ModelRuntime>;

/// Room for the longest textual IPv6 address plus NUL.
pub const PEER_HOST_LEN: usize = 46;

/// One polled event. `peer_handle` is 0 and `peer_host` empty when the event has no peer;
/// `packet_handle` is 0 when it carries no packet.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EnetBridgeEvent {
    pub event_type: i32,
    pub peer_handle: i64,
    pub peer_host: [c_char; PEER_HOST_LEN],
    pub peer_port: i32,
    pub channel_id: i8,
    pub data: i32,
    pub packet_handle: i64,
    pub packet_flags: i32,
    pub packet_len: usize,
}

impl Default for EnetBridgeEvent {
    fn default() -> Self {
        Self {
            event_type: 0,
            peer_handle: 0,
            peer_host: [0; PEER_HOST_LEN],
            peer_port: 0,
            channel_id: 0,
            data: 0,
            packet_handle: 0,
            packet_flags: 0,
            packet_len: 0,
        }
    }
}

impl EnetBridgeEvent {
    fn fill(event: &Event) -> Self {
        let mut out = Self {
            event_type: event.kind,
            channel_id: event.channel_id,
            data: event.data,
            ..Self::default()
        };
        if let Some(peer) = &event.peer {
            out.peer_handle = peer.handle;
            out.peer_port = peer.address.port;
            let host = peer.address.host.as_bytes();
            let n = host.len().min(PEER_HOST_LEN - 1);
            for (dst, &src) in out.peer_host.iter_mut().zip(&host[..n]) {
                *dst = src as c_char;
            }
        }
        if let Some(packet) = &event.packet {
            out.packet_handle = packet.handle;
            out.packet_flags = packet.flags;
            out.packet_len = packet.data.len();
        }
        out
    }
}

fn context<'a>(ctx: *mut c_void) -> Option<&'a mut Context> {
    if ctx.is_null() {
        return None;
    }
    Some(unsafe { &mut *(ctx as *mut Context) })
}

/// Null pointer reads as "no host"; invalid UTF-8 is an error.
fn optional_str<'a>(s: *const c_char) -> Result<Option<&'a str>, ()> {
    if s.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map(Some)
        .map_err(|_| ())
}

fn bytes<'a>(data: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        return None;
    }
    Some(unsafe { slice::from_raw_parts(data, len) })
}

/// Load the managed bindings and return an opaque context, or null on failure.
#[no_mangle]
pub extern "C" fn enet_bridge_attach() -> *mut c_void {
    match Bridge::attach(DatagramEngine::new(), ModelRuntime::new()) {
        Ok(bridge) => Box::into_raw(Box::new(bridge)) as *mut c_void,
        Err(e) => {
            tracing::warn!("attach failed: {}", e);
            std::ptr::null_mut()
        }
    }
}

/// Release the context (deinitializing if needed). No-op if ctx is null.
#[no_mangle]
pub extern "C" fn enet_bridge_detach(ctx: *mut c_void) {
    if ctx.is_null() {
        return;
    }
    let bridge = unsafe { Box::from_raw(ctx as *mut Context) };
    let _ = bridge.detach();
}

/// Returns 0 on success, -1 on failure or null ctx.
#[no_mangle]
pub extern "C" fn enet_bridge_initialize(ctx: *mut c_void) -> c_int {
    match context(ctx) {
        Some(b) => b.initialize(),
        None => -1,
    }
}

#[no_mangle]
pub extern "C" fn enet_bridge_deinitialize(ctx: *mut c_void) {
    if let Some(b) = context(ctx) {
        b.deinitialize();
    }
}

/// Server host. `host` may be null (all interfaces). Returns a handle, 0 on failure.
#[no_mangle]
pub extern "C" fn enet_bridge_create_host(
    ctx: *mut c_void,
    host: *const c_char,
    port: i32,
    max_clients: i32,
    max_channels: i32,
    incoming_bandwidth: i32,
    outgoing_bandwidth: i32,
) -> i64 {
    let (Some(b), Ok(host)) = (context(ctx), optional_str(host)) else {
        return 0;
    };
    b.create_host(
        host,
        port,
        max_clients,
        max_channels,
        incoming_bandwidth,
        outgoing_bandwidth,
    )
}

/// Client host. Null `host` or port 0 binds all interfaces on an ephemeral port.
#[no_mangle]
pub extern "C" fn enet_bridge_create_host_bound(
    ctx: *mut c_void,
    host: *const c_char,
    port: i32,
    max_peers: i32,
    max_channels: i32,
    incoming_bandwidth: i32,
    outgoing_bandwidth: i32,
) -> i64 {
    let (Some(b), Ok(host)) = (context(ctx), optional_str(host)) else {
        return 0;
    };
    b.create_host_bound(
        host,
        port,
        max_peers,
        max_channels,
        incoming_bandwidth,
        outgoing_bandwidth,
    )
}

/// Returns the peer handle, 0 on failure. Completion is reported later by `enet_bridge_service`.
#[no_mangle]
pub extern "C" fn enet_bridge_connect(
    ctx: *mut c_void,
    host_handle: i64,
    host: *const c_char,
    port: i32,
    channel_count: i32,
    data: i32,
) -> i64 {
    let (Some(b), Ok(Some(host))) = (context(ctx), optional_str(host)) else {
        return 0;
    };
    b.connect(host_handle, host, port, channel_count, data)
}

/// Wait up to `timeout_millis` for one event. Returns 1 and fills `out_event` (and copies the
/// packet payload to `out_buf`) when an event arrived, 0 when none did, -1 on error. If the
/// payload does not fit, `out_event.packet_len` holds the needed size, -1 is returned and the
/// event is gone.
#[no_mangle]
pub extern "C" fn enet_bridge_service(
    ctx: *mut c_void,
    host_handle: i64,
    timeout_millis: i32,
    out_event: *mut EnetBridgeEvent,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if out_event.is_null() {
        return -1;
    }
    let Some(b) = context(ctx) else {
        return -1;
    };
    let Some(value) = b.service(host_handle, timeout_millis) else {
        return 0;
    };
    let event = value.clone().into_event();
    b.runtime_mut().delete_local_ref(value);
    let Some(event) = event else {
        return -1;
    };
    let filled = EnetBridgeEvent::fill(&event);
    unsafe {
        out_event.write(filled);
    }
    let payload = event.packet.as_ref().map_or(&[][..], |p| p.data.as_slice());
    if payload.is_empty() {
        return 1;
    }
    if out_buf.is_null() || payload.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(payload.as_ptr(), payload.len());
    }
    1
}

/// Returns 0 if the packet was queued, -1 otherwise.
#[no_mangle]
pub extern "C" fn enet_bridge_send(
    ctx: *mut c_void,
    host_handle: i64,
    peer_handle: i64,
    channel_id: i8,
    data: *const u8,
    len: usize,
    flags: i32,
) -> c_int {
    let (Some(b), Some(data)) = (context(ctx), bytes(data, len)) else {
        return -1;
    };
    b.send(host_handle, peer_handle, channel_id, data, flags)
}

#[no_mangle]
pub extern "C" fn enet_bridge_broadcast(
    ctx: *mut c_void,
    host_handle: i64,
    channel_id: i8,
    data: *const u8,
    len: usize,
    flags: i32,
) {
    if let (Some(b), Some(data)) = (context(ctx), bytes(data, len)) {
        b.broadcast(host_handle, channel_id, data, flags);
    }
}

#[no_mangle]
pub extern "C" fn enet_bridge_flush(ctx: *mut c_void, host_handle: i64) {
    if let Some(b) = context(ctx) {
        b.flush(host_handle);
    }
}

#[no_mangle]
pub extern "C" fn enet_bridge_disconnect_peer(
    ctx: *mut c_void,
    host_handle: i64,
    peer_handle: i64,
    data: i32,
) {
    if let Some(b) = context(ctx) {
        b.disconnect_peer(host_handle, peer_handle, data);
    }
}

/// Destroy a host. No-op for handle 0 or null ctx.
#[no_mangle]
pub extern "C" fn enet_bridge_destroy(ctx: *mut c_void, host_handle: i64) {
    if let Some(b) = context(ctx) {
        b.destroy(host_handle);
    }
}
