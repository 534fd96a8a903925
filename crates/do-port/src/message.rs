//! Wire messages
//!
//! Every message travels as one self-delimiting frame:
//!
//! ```text
//! +--------+---------+------+-------+----------+----------------+---------+
//! | length | version | kind | flags | sequence | connection tag | payload |
//! |  u32   |   u8    |  u8  |  u16  |   u32    |      u32       |   ...   |
//! +--------+---------+------+-------+----------+----------------+---------+
//! ```
//!
//! All header fields are big-endian; `length` covers the whole frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{PortError, Result};

/// Current framing version
pub const PROTOCOL_VERSION: u8 = 1;

/// Request is oneway: no reply will be sent
pub const FLAG_ONEWAY: u16 = 0x0001;

/// Message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    MethodRequest = 0,
    MethodReply = 1,
    RootProxyRequest = 2,
    RootProxyReply = 3,
    ConnectionShutdown = 4,
    MethodTypeRequest = 5,
    MethodTypeReply = 6,
    ProxyRelease = 7,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::MethodRequest),
            1 => Some(MessageKind::MethodReply),
            2 => Some(MessageKind::RootProxyRequest),
            3 => Some(MessageKind::RootProxyReply),
            4 => Some(MessageKind::ConnectionShutdown),
            5 => Some(MessageKind::MethodTypeRequest),
            6 => Some(MessageKind::MethodTypeReply),
            7 => Some(MessageKind::ProxyRelease),
            _ => None,
        }
    }

    /// Whether this message answers an earlier request
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::MethodReply | MessageKind::RootProxyReply | MessageKind::MethodTypeReply
        )
    }
}

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: u32,
    pub version: u8,
    pub kind: MessageKind,
    pub flags: u16,
    pub sequence: u32,
    pub connection_tag: u32,
}

impl MessageHeader {
    /// Header size in bytes
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.flags);
        buf.put_u32(self.sequence);
        buf.put_u32(self.connection_tag);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(PortError::InvalidMessage(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }
        let version = data[4];
        if version != PROTOCOL_VERSION {
            return Err(PortError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let kind = MessageKind::from_u8(data[5])
            .ok_or_else(|| PortError::InvalidMessage(format!("unknown message kind {}", data[5])))?;
        Ok(Self {
            length: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            version,
            kind,
            flags: u16::from_be_bytes([data[6], data[7]]),
            sequence: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            connection_tag: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
        })
    }

    /// Frame length read from the first four bytes, before full validation
    pub fn peek_length(data: &[u8]) -> Option<usize> {
        data.get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }
}

/// One message exchanged between ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub flags: u16,
    pub sequence: u32,
    pub connection_tag: u32,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(kind: MessageKind, sequence: u32, connection_tag: u32, payload: Bytes) -> Self {
        Self {
            kind,
            flags: 0,
            sequence,
            connection_tag,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_oneway(&self) -> bool {
        self.flags & FLAG_ONEWAY != 0
    }

    /// Size of the encoded frame
    pub fn encoded_len(&self) -> usize {
        MessageHeader::SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let size = self.encoded_len();
        let length = u32::try_from(size).map_err(|_| PortError::FrameTooLarge {
            size,
            max: u32::MAX as usize,
        })?;
        let header = MessageHeader {
            length,
            version: PROTOCOL_VERSION,
            kind: self.kind,
            flags: self.flags,
            sequence: self.sequence,
            connection_tag: self.connection_tag,
        };
        let mut buf = BytesMut::with_capacity(size);
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode exactly one frame
    pub fn decode(data: Bytes) -> Result<Self> {
        let header = MessageHeader::decode(&data)?;
        if header.length as usize != data.len() {
            return Err(PortError::InvalidMessage(format!(
                "frame length {} does not match {} bytes received",
                header.length,
                data.len()
            )));
        }
        Ok(Self {
            kind: header.kind,
            flags: header.flags,
            sequence: header.sequence,
            connection_tag: header.connection_tag,
            payload: data.slice(MessageHeader::SIZE..),
        })
    }
}
