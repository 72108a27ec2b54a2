//! Dual-stack address translation between the engine's 16-byte binary form and (host, port) text.
//!
//! IPv4 endpoints live in the engine as IPv4-mapped IPv6 (`::ffff:a.b.c.d`). Decoding never fails:
//! canonical IPv6 text first, then the embedded IPv4 tail, then the literal `0.0.0.0`. The
//! `DecodeOrigin` records which step produced the text so callers can tell a real wildcard from
//! a fallback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use crate::model::Address;

/// Host strings that bind to all interfaces.
pub const WILDCARD_LITERALS: [&str; 3] = ["0.0.0.0", "::", ""];

/// Text produced when nothing else could be decoded.
pub const FALLBACK_HOST: &str = "0.0.0.0";

/// Engine-side address: 16 bytes of IPv6 (network order) plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeAddress {
    pub host: [u8; 16],
    pub port: u16,
}

impl NativeAddress {
    /// `in6addr_any` on the given port.
    pub fn any(port: u16) -> Self {
        Self {
            host: [0u8; 16],
            port,
        }
    }

    pub fn is_any(&self) -> bool {
        self.host == [0u8; 16]
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        let host = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { host, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), addr.port())
    }

    /// IPv4-mapped hosts come back as `SocketAddr::V4`, everything else as V6.
    pub fn to_socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.host);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, self.port)),
            None => SocketAddr::V6(SocketAddrV6::new(v6, self.port, 0, 0)),
        }
    }
}

/// Which decoding step produced the host text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOrigin {
    Canonical,
    EmbeddedIpv4,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHost {
    pub host: String,
    pub origin: DecodeOrigin,
}

/// Resolution failure for a host string. Never collapsed into the wildcard.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("cannot resolve host {host:?}: {source}")]
    Unresolvable {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("host {0:?} resolved to no addresses")]
    NoAddresses(String),
}

pub fn is_wildcard(host: &str) -> bool {
    WILDCARD_LITERALS.contains(&host)
}

/// Canonical IPv6 text. IPv4-mapped addresses have none in this scheme; they read as dotted IPv4.
fn canonical_text(bytes: &[u8]) -> Option<String> {
    let octets: [u8; 16] = bytes.try_into().ok()?;
    let v6 = Ipv6Addr::from(octets);
    if v6.to_ipv4_mapped().is_some() {
        return None;
    }
    Some(v6.to_string())
}

/// Trailing four bytes of a 16-byte host, or a bare 4-byte host, as dotted IPv4.
fn embedded_ipv4(bytes: &[u8]) -> Option<String> {
    let tail: [u8; 4] = match bytes.len() {
        16 => bytes[12..].try_into().ok()?,
        4 => bytes.try_into().ok()?,
        _ => return None,
    };
    Some(Ipv4Addr::from(tail).to_string())
}

/// Decode raw host bytes. Always produces a value.
pub fn decode_host(bytes: &[u8]) -> DecodedHost {
    if let Some(host) = canonical_text(bytes) {
        return DecodedHost {
            host,
            origin: DecodeOrigin::Canonical,
        };
    }
    if let Some(host) = embedded_ipv4(bytes) {
        return DecodedHost {
            host,
            origin: DecodeOrigin::EmbeddedIpv4,
        };
    }
    tracing::debug!(len = bytes.len(), "undecodable host bytes, using {}", FALLBACK_HOST);
    DecodedHost {
        host: FALLBACK_HOST.to_string(),
        origin: DecodeOrigin::Fallback,
    }
}

/// Decode an engine address into its managed form.
/// IPv4-mapped hosts come out as dotted IPv4 (`1.2.3.4`), not as `::ffff:1.2.3.4`.
pub fn decode(addr: &NativeAddress) -> Address {
    Address::new(decode_host(&addr.host).host, i32::from(addr.port))
}

/// Encode a host string: wildcard literals map to `in6addr_any`; anything else is parsed as an IP
/// literal (brackets allowed) or resolved, preferring IPv4 results.
pub fn encode(host: &str) -> Result<[u8; 16], AddressError> {
    if is_wildcard(host) {
        return Ok([0u8; 16]);
    }
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(NativeAddress::from_ip(ip, 0).host);
    }
    let resolved: Vec<SocketAddr> = (literal, 0)
        .to_socket_addrs()
        .map_err(|source| AddressError::Unresolvable {
            host: host.to_string(),
            source,
        })?
        .collect();
    let pick = resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .ok_or_else(|| AddressError::NoAddresses(host.to_string()))?;
    Ok(NativeAddress::from_ip(pick.ip(), 0).host)
}

pub fn encode_with_port(host: &str, port: u16) -> Result<NativeAddress, AddressError> {
    Ok(NativeAddress {
        host: encode(host)?,
        port,
    })
}
