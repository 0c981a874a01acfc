//! weft-protocol: Wire protocol for weft channel multiplexing
//!
//! This crate defines the two binary formats spoken between tunnel peers:
//! the multiplexer frames that carve one transport into many channels, and
//! the control messages exchanged on the reserved control channel.

pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod port;

pub use codec::{Frame, FrameCodec};
pub use control::{ControlCodec, ControlKind, ControlMessage, ResponseCode, MAX_PARAMETER_BLOB};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use port::VirtualPort;
