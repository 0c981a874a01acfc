//! weft-mux: Channel multiplexer for weft
//!
//! Carves one ordered, reliable byte stream into many independent channels.
//! A channel is addressed TCP-style by its (local, remote) virtual port pair.
//! Each direction of each channel has its own credit window, so a consumer
//! that stops reading only stalls its own channel.
//!
//! ```ignore
//! let mux = Multiplexer::new(transport, MuxConfig::default());
//! let mut listener = mux.listen(VirtualPort::new(80))?;
//! let channel = listener.accept().await?;
//! ```

mod channel;
mod listener;
mod multiplexer;
mod ports;

pub use channel::{Channel, ChannelReader, ChannelWriter};
pub use listener::Listener;
pub use multiplexer::Multiplexer;
pub use ports::{ChannelKey, EPHEMERAL_PORTS};

pub use weft_core::config::MuxConfig;
pub use weft_core::error::MuxError;
pub use weft_protocol::VirtualPort;
