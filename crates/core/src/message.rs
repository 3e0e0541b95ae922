//! Datagrams exchanged with peers and the transaction header they carry.
//!
//! Every signalling message starts with a fixed 8 byte header:
//!
//! ```text
//!  0        1        2                 4                                 8
//! +--------+--------+-----------------+---------------------------------+
//! | version|  kind  |     reserved    |        transaction id (BE)      |
//! +--------+--------+-----------------+---------------------------------+
//! |                     opaque protocol body ...                        |
//! ```
//!
//! A request and its response carry the same transaction id; matching is by
//! exact id equality. The body is never interpreted here.

use std::{fmt, net::SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 8;
pub const WIRE_VERSION: u8 = 1;
/// Largest datagram a node reads or writes.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Identity of a remote node: the address its signalling endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(SocketAddr);

impl PeerId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of one of the node's bound sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u16);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Raw bytes received from a peer on one of our sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub socket: SocketId,
    pub peer: PeerId,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            other => Err(MessageError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XactHeader {
    pub kind: MessageKind,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("datagram truncated, length: {len}")]
    Truncated { len: usize },
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("transaction id 0 is reserved")]
    ReservedId,
    #[error("message too big, size: {size}, max size: {max_size}")]
    TooLarge { size: usize, max_size: usize },
}

pub fn encode(header: XactHeader, body: &[u8]) -> Result<Bytes, MessageError> {
    let size = HEADER_LEN + body.len();
    if size > MAX_DATAGRAM_SIZE {
        return Err(MessageError::TooLarge {
            size,
            max_size: MAX_DATAGRAM_SIZE,
        });
    }
    if header.id == 0 {
        return Err(MessageError::ReservedId);
    }
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(header.kind as u8);
    buf.put_u16(0);
    buf.put_u32(header.id);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Splits a datagram into its header and body. The body shares the input
/// buffer.
pub fn decode(raw: &Bytes) -> Result<(XactHeader, Bytes), MessageError> {
    if raw.len() < HEADER_LEN {
        return Err(MessageError::Truncated { len: raw.len() });
    }
    if raw.len() > MAX_DATAGRAM_SIZE {
        return Err(MessageError::TooLarge {
            size: raw.len(),
            max_size: MAX_DATAGRAM_SIZE,
        });
    }
    let mut header = &raw[..HEADER_LEN];
    let version = header.get_u8();
    if version != WIRE_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    let kind = MessageKind::try_from(header.get_u8())?;
    let _reserved = header.get_u16();
    let id = header.get_u32();
    if id == 0 {
        return Err(MessageError::ReservedId);
    }
    Ok((XactHeader { kind, id }, raw.slice(HEADER_LEN..)))
}
