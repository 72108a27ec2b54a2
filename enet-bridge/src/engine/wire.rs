//! Datagram framing for the datagram engine: 1 version byte + bincode payload, one message per
//! UDP datagram.

use serde::{Deserialize, Serialize};

pub const WIRE_VERSION: u8 = 1;

/// Largest application payload carried in one datagram (no fragmentation).
pub const MAX_PAYLOAD_LEN: usize = 60 * 1024;

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    /// Handshake request from the connecting side.
    Connect {
        connect_id: u32,
        channel_count: u8,
        data: u32,
    },
    /// Handshake acceptance, carrying the negotiated channel count.
    VerifyConnect { connect_id: u32, channel_count: u8 },
    /// Graceful disconnect or refusal.
    Disconnect { connect_id: u32, data: u32 },
    Payload {
        connect_id: u32,
        channel_id: u8,
        flags: u32,
        data: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("datagram too large")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramDecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode_datagram(msg: &Datagram) -> Result<Vec<u8>, DatagramEncodeError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() + 1 > MAX_DATAGRAM_LEN {
        return Err(DatagramEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(WIRE_VERSION);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, DatagramDecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DatagramDecodeError::Empty)?;
    if version != WIRE_VERSION {
        return Err(DatagramDecodeError::Version(version));
    }
    Ok(bincode::deserialize(body)?)
}
