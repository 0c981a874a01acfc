//! Tokio codec for multiplexer frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FrameKind, MAX_PAYLOAD_SIZE};
use crate::port::VirtualPort;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender's end of the channel
    pub src: VirtualPort,
    /// Receiver's end of the channel
    pub dst: VirtualPort,
    /// Frame kind
    pub kind: FrameKind,
    /// Raw payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(src: VirtualPort, dst: VirtualPort, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            src,
            dst,
            kind,
            payload,
        }
    }

    fn with_u32(src: VirtualPort, dst: VirtualPort, kind: FrameKind, value: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(value);
        Self::new(src, dst, kind, buf.freeze())
    }

    pub fn open(src: VirtualPort, dst: VirtualPort, window: u32) -> Self {
        Self::with_u32(src, dst, FrameKind::Open, window)
    }

    pub fn open_ack(src: VirtualPort, dst: VirtualPort, window: u32) -> Self {
        Self::with_u32(src, dst, FrameKind::OpenAck, window)
    }

    pub fn refuse(src: VirtualPort, dst: VirtualPort) -> Self {
        Self::new(src, dst, FrameKind::Refuse, Bytes::new())
    }

    pub fn data(src: VirtualPort, dst: VirtualPort, payload: Bytes) -> Self {
        Self::new(src, dst, FrameKind::Data, payload)
    }

    pub fn window_update(src: VirtualPort, dst: VirtualPort, increment: u32) -> Self {
        Self::with_u32(src, dst, FrameKind::WindowUpdate, increment)
    }

    pub fn fin(src: VirtualPort, dst: VirtualPort) -> Self {
        Self::new(src, dst, FrameKind::Fin, Bytes::new())
    }

    pub fn close(src: VirtualPort, dst: VirtualPort) -> Self {
        Self::new(src, dst, FrameKind::Close, Bytes::new())
    }

    pub fn reset(src: VirtualPort, dst: VirtualPort) -> Self {
        Self::new(src, dst, FrameKind::Reset, Bytes::new())
    }

    /// Read the u32 carried by `Open`, `OpenAck` and `WindowUpdate` frames
    pub fn window(&self) -> Result<u32, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::InvalidPayload {
                kind: self.kind.name(),
                expected: 4,
                actual: self.payload.len(),
            });
        }
        Ok(self.payload.clone().get_u32())
    }
}

/// Codec for encoding/decoding multiplexer frames
#[derive(Debug)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
    /// Largest payload accepted from the peer
    max_payload: usize,
}

impl FrameCodec {
    /// Create a new codec accepting payloads up to the protocol maximum
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Create a codec with a tighter payload limit
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            pending_header: None,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            src: header.src,
            dst: header.dst,
            kind: header.kind,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending_header.is_none() => Ok(None),
            None => Err(ProtocolError::TornFrame {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(frame.src, frame.dst, frame.kind, payload_len as u32);
        header.encode(dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    fn ports() -> (VirtualPort, VirtualPort) {
        (VirtualPort::new(49152), VirtualPort::new(8080))
    }

    #[test]
    fn test_codec_data_frame() {
        let mut codec = FrameCodec::new();
        let (src, dst) = ports();

        let frame = Frame::data(src, dst, Bytes::from("Hello, world!"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 13);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_codec_window_value() {
        let mut codec = FrameCodec::new();
        let (src, dst) = ports();

        let mut buf = BytesMut::new();
        codec
            .encode(Frame::window_update(src, dst, 65536), &mut buf)
            .unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::WindowUpdate);
        assert_eq!(decoded.window().unwrap(), 65536);
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = FrameCodec::new();
        let (src, dst) = ports();

        let mut full_buf = BytesMut::new();
        codec
            .encode(Frame::data(src, dst, Bytes::from_static(b"payload")), &mut full_buf)
            .unwrap();

        // Header complete, payload missing
        let mut partial = full_buf.split_to(HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"payload");
    }

    #[test]
    fn test_codec_interleaved_frames() {
        let mut codec = FrameCodec::new();
        let a = (VirtualPort::new(50000), VirtualPort::new(80));
        let b = (VirtualPort::new(50001), VirtualPort::new(443));

        let mut buf = BytesMut::new();
        codec.encode(Frame::data(a.0, a.1, Bytes::from_static(b"a1")), &mut buf).unwrap();
        codec.encode(Frame::data(b.0, b.1, Bytes::from_static(b"b1")), &mut buf).unwrap();
        codec.encode(Frame::fin(a.0, a.1), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        let third = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!((first.dst, first.payload.as_ref()), (VirtualPort::new(80), &b"a1"[..]));
        assert_eq!((second.dst, second.payload.as_ref()), (VirtualPort::new(443), &b"b1"[..]));
        assert_eq!(third.kind, FrameKind::Fin);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_torn_frame_at_eof() {
        let mut codec = FrameCodec::new();
        let (src, dst) = ports();

        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data(src, dst, Bytes::from_static(b"truncated")), &mut buf)
            .unwrap();
        buf.truncate(HEADER_SIZE + 3);

        let result = codec.decode_eof(&mut buf);
        assert!(matches!(result, Err(ProtocolError::TornFrame { buffered: 3 })));
    }

    #[test]
    fn test_codec_clean_eof() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::with_max_payload(16);
        let (src, dst) = ports();

        let mut buf = BytesMut::new();
        FrameCodec::new()
            .encode(Frame::data(src, dst, Bytes::from(vec![0u8; 32])), &mut buf)
            .unwrap();

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 32, max: 16 })
        ));
    }
}
