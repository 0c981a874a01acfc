//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - src_port: 2 bytes (u16, big-endian), the sender's virtual port
//! - dst_port: 2 bytes (u16, big-endian), the receiver's virtual port
//! - kind: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::port::VirtualPort;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Multiplexer frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request to open a channel, carries the opener's receive window
    Open = 0x01,
    /// Channel accepted, carries the acceptor's receive window
    OpenAck = 0x02,
    /// Channel refused (no listener, backlog full, or pair in use)
    Refuse = 0x03,
    /// Channel data
    Data = 0x04,
    /// Returns receive credit to the sender
    WindowUpdate = 0x05,
    /// Sender will write no more data (half-close)
    Fin = 0x06,
    /// Sender has fully closed its end
    Close = 0x07,
    /// Abrupt close
    Reset = 0x08,
}

impl FrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::OpenAck),
            0x03 => Some(Self::Refuse),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::WindowUpdate),
            0x06 => Some(Self::Fin),
            0x07 => Some(Self::Close),
            0x08 => Some(Self::Reset),
            _ => None,
        }
    }

    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::OpenAck => "open-ack",
            Self::Refuse => "refuse",
            Self::Data => "data",
            Self::WindowUpdate => "window-update",
            Self::Fin => "fin",
            Self::Close => "close",
            Self::Reset => "reset",
        }
    }

    /// Exact payload length this kind requires, if fixed
    pub fn fixed_payload_len(&self) -> Option<usize> {
        match self {
            Self::Open | Self::OpenAck | Self::WindowUpdate => Some(4),
            Self::Refuse | Self::Fin | Self::Close | Self::Reset => Some(0),
            Self::Data => None,
        }
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sender's end of the channel
    pub src: VirtualPort,
    /// Receiver's end of the channel
    pub dst: VirtualPort,
    /// Kind of frame
    pub kind: FrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(src: VirtualPort, dst: VirtualPort, kind: FrameKind, payload_length: u32) -> Self {
        Self {
            src,
            dst,
            kind,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u16(self.src.as_u16());
        dst.put_u16(self.dst.as_u16());
        dst.put_u8(self.kind.as_u8());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown kind or a payload
    /// length the kind does not allow).
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate before consuming anything
        let kind_byte = src[4];
        let kind = FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;
        let payload_length = ((src[5] as u32) << 16) | ((src[6] as u32) << 8) | src[7] as u32;

        if let Some(expected) = kind.fixed_payload_len() {
            if payload_length as usize != expected {
                return Err(ProtocolError::InvalidPayload {
                    kind: kind.name(),
                    expected,
                    actual: payload_length as usize,
                });
            }
        }

        let src_port = VirtualPort::new(src.get_u16());
        let dst_port = VirtualPort::new(src.get_u16());
        src.advance(4); // kind + length already parsed

        Ok(Some(Self {
            src: src_port,
            dst: dst_port,
            kind,
            payload_length,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(
            VirtualPort::new(49152),
            VirtualPort::new(8080),
            FrameKind::Data,
            12345,
        );

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(
            VirtualPort::new(1),
            VirtualPort::new(2),
            FrameKind::Data,
            MAX_PAYLOAD_SIZE as u32,
        );

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        let result = FrameHeader::decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_unknown_frame_kind() {
        let mut buf = BytesMut::from(&[0, 1, 0, 2, 0xFE, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownFrameKind(0xFE))));
    }

    #[test]
    fn test_fixed_length_kind_rejects_wrong_payload() {
        // Fin must carry no payload
        let mut buf = BytesMut::from(&[0, 1, 0, 2, 0x06, 0, 0, 3][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidPayload { kind: "fin", expected: 0, actual: 3 })
        ));
    }
}
