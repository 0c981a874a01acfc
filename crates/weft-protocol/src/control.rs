//! Control messages exchanged on the control channel
//!
//! Requests ask the peer to create, stop, or report on a service running in
//! its process. Each request carries a correlation id that the matching
//! response echoes, so several requests can be in flight on one channel.
//!
//! # Wire format
//!
//! Requests (`Create`, `Stop`, `QueryStatus`):
//!
//! ```text
//! kind: u8 | correlation_id: u32 | service_kind_id: u32 | instance_id: u32 | blob_len: u32 | blob
//! ```
//!
//! `Create` and `QueryStatus` send `instance_id = 0`; `Stop` sends
//! `service_kind_id = 0` and an empty blob.
//!
//! Responses:
//!
//! ```text
//! kind: u8 | correlation_id: u32 | status: u32 | instance_id: u32
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Largest parameter blob a request may carry
pub const MAX_PARAMETER_BLOB: usize = 64 * 1024;

const REQUEST_HEADER_SIZE: usize = 1 + 4 + 4 + 4 + 4;
const RESPONSE_SIZE: usize = 1 + 4 + 4 + 4;

/// Control message kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Create = 0x01,
    Stop = 0x02,
    QueryStatus = 0x03,
    Response = 0x04,
}

impl ControlKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Create),
            0x02 => Some(Self::Stop),
            0x03 => Some(Self::QueryStatus),
            0x04 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Status carried by a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    /// Request succeeded
    Ok = 0,
    /// No instance matches the queried descriptor
    NotFound = 1,
    /// Instance exists and is starting
    Starting = 2,
    /// Instance is running
    Running = 3,
    /// Instance has failed
    Failed = 4,
    /// Instance was created but could not start
    StartFailed = 5,
    /// The peer does not know the requested service kind
    UnknownService = 6,
    /// Parameters could not be decoded or are missing fields
    InvalidParameters = 7,
}

impl ResponseCode {
    /// Convert to u32
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::NotFound),
            2 => Some(Self::Starting),
            3 => Some(Self::Running),
            4 => Some(Self::Failed),
            5 => Some(Self::StartFailed),
            6 => Some(Self::UnknownService),
            7 => Some(Self::InvalidParameters),
            _ => None,
        }
    }
}

/// Control protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Create (or look up) a service instance
    Create {
        correlation_id: u32,
        service_kind: u32,
        parameters: Bytes,
    },

    /// Stop a service instance
    Stop {
        correlation_id: u32,
        instance_id: u32,
    },

    /// Report the status of the instance matching a descriptor
    QueryStatus {
        correlation_id: u32,
        service_kind: u32,
        parameters: Bytes,
    },

    /// Answer to any request
    Response {
        correlation_id: u32,
        status: u32,
        instance_id: u32,
    },
}

impl ControlMessage {
    /// Get the kind of this message
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Create { .. } => ControlKind::Create,
            ControlMessage::Stop { .. } => ControlKind::Stop,
            ControlMessage::QueryStatus { .. } => ControlKind::QueryStatus,
            ControlMessage::Response { .. } => ControlKind::Response,
        }
    }

    /// Correlation id shared by a request and its response
    pub fn correlation_id(&self) -> u32 {
        match self {
            ControlMessage::Create { correlation_id, .. }
            | ControlMessage::Stop { correlation_id, .. }
            | ControlMessage::QueryStatus { correlation_id, .. }
            | ControlMessage::Response { correlation_id, .. } => *correlation_id,
        }
    }

    /// Build a response to this message
    pub fn respond(&self, code: ResponseCode, instance_id: u32) -> ControlMessage {
        ControlMessage::Response {
            correlation_id: self.correlation_id(),
            status: code.as_u32(),
            instance_id,
        }
    }
}

/// Codec for control messages
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let kind_byte = src[0];
        let kind =
            ControlKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownControlKind(kind_byte))?;

        if kind == ControlKind::Response {
            if src.len() < RESPONSE_SIZE {
                return Ok(None);
            }
            src.advance(1);
            return Ok(Some(ControlMessage::Response {
                correlation_id: src.get_u32(),
                status: src.get_u32(),
                instance_id: src.get_u32(),
            }));
        }

        if src.len() < REQUEST_HEADER_SIZE {
            return Ok(None);
        }

        let blob_len = u32::from_be_bytes([src[13], src[14], src[15], src[16]]) as usize;
        if blob_len > MAX_PARAMETER_BLOB {
            return Err(ProtocolError::PayloadTooLarge {
                size: blob_len,
                max: MAX_PARAMETER_BLOB,
            });
        }
        if src.len() < REQUEST_HEADER_SIZE + blob_len {
            src.reserve(REQUEST_HEADER_SIZE + blob_len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let correlation_id = src.get_u32();
        let service_kind = src.get_u32();
        let instance_id = src.get_u32();
        src.advance(4);
        let parameters = src.split_to(blob_len).freeze();

        let message = match kind {
            ControlKind::Create => ControlMessage::Create {
                correlation_id,
                service_kind,
                parameters,
            },
            ControlKind::QueryStatus => ControlMessage::QueryStatus {
                correlation_id,
                service_kind,
                parameters,
            },
            ControlKind::Stop => ControlMessage::Stop {
                correlation_id,
                instance_id,
            },
            ControlKind::Response => unreachable!("responses are decoded above"),
        };

        Ok(Some(message))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = message.kind();
        match message {
            ControlMessage::Response {
                correlation_id,
                status,
                instance_id,
            } => {
                dst.reserve(RESPONSE_SIZE);
                dst.put_u8(kind.as_u8());
                dst.put_u32(correlation_id);
                dst.put_u32(status);
                dst.put_u32(instance_id);
            }
            ControlMessage::Stop {
                correlation_id,
                instance_id,
            } => put_request(dst, kind, correlation_id, 0, instance_id, &[])?,
            ControlMessage::Create {
                correlation_id,
                service_kind,
                parameters,
            }
            | ControlMessage::QueryStatus {
                correlation_id,
                service_kind,
                parameters,
            } => put_request(dst, kind, correlation_id, service_kind, 0, &parameters)?,
        }
        Ok(())
    }
}

fn put_request(
    dst: &mut BytesMut,
    kind: ControlKind,
    correlation_id: u32,
    service_kind: u32,
    instance_id: u32,
    blob: &[u8],
) -> Result<(), ProtocolError> {
    if blob.len() > MAX_PARAMETER_BLOB {
        return Err(ProtocolError::PayloadTooLarge {
            size: blob.len(),
            max: MAX_PARAMETER_BLOB,
        });
    }
    dst.reserve(REQUEST_HEADER_SIZE + blob.len());
    dst.put_u8(kind.as_u8());
    dst.put_u32(correlation_id);
    dst.put_u32(service_kind);
    dst.put_u32(instance_id);
    dst.put_u32(blob.len() as u32);
    dst.extend_from_slice(blob);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: ControlMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        ControlCodec::new().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_create_request_layout() {
        let buf = encode(ControlMessage::Create {
            correlation_id: 7,
            service_kind: 2,
            parameters: Bytes::from_static(b"abc"),
        });

        assert_eq!(buf.len(), REQUEST_HEADER_SIZE + 3);
        assert_eq!(buf[0], ControlKind::Create.as_u8());
        assert_eq!(&buf[1..5], &7u32.to_be_bytes());
        assert_eq!(&buf[5..9], &2u32.to_be_bytes());
        assert_eq!(&buf[9..13], &0u32.to_be_bytes());
        assert_eq!(&buf[13..17], &3u32.to_be_bytes());
        assert_eq!(&buf[17..], b"abc");
    }

    #[test]
    fn test_stop_request_decodes() {
        let mut buf = encode(ControlMessage::Stop {
            correlation_id: 9,
            instance_id: 42,
        });

        let decoded = ControlCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            ControlMessage::Stop {
                correlation_id: 9,
                instance_id: 42
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_and_request_back_to_back() {
        let mut buf = encode(ControlMessage::Response {
            correlation_id: 1,
            status: ResponseCode::Running.as_u32(),
            instance_id: 3,
        });
        buf.extend_from_slice(&encode(ControlMessage::QueryStatus {
            correlation_id: 2,
            service_kind: 1,
            parameters: Bytes::from_static(b"params"),
        }));

        let mut codec = ControlCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.kind(), ControlKind::Response);
        assert_eq!(second.correlation_id(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_request_waits_for_blob() {
        let full = encode(ControlMessage::Create {
            correlation_id: 5,
            service_kind: 1,
            parameters: Bytes::from_static(b"0123456789"),
        });

        let mut codec = ControlCodec::new();
        let mut partial = BytesMut::from(&full[..REQUEST_HEADER_SIZE + 4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[REQUEST_HEADER_SIZE + 4..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.correlation_id(), 5);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut buf = BytesMut::from(&[0x7F, 0, 0, 0, 0][..]);
        let result = ControlCodec::new().decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownControlKind(0x7F))));
    }

    #[test]
    fn test_respond_echoes_correlation_id() {
        let request = ControlMessage::Stop {
            correlation_id: 77,
            instance_id: 4,
        };
        let response = request.respond(ResponseCode::Ok, 4);
        assert_eq!(response.correlation_id(), 77);
    }
}
