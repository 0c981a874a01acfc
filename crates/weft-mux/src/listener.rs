//! Inbound channel acceptor

use std::sync::Arc;

use tokio::sync::mpsc;
use weft_core::error::MuxError;
use weft_protocol::VirtualPort;

use crate::channel::Channel;
use crate::multiplexer::MuxInner;

/// Accepts channels the peer opens at one virtual port.
///
/// Dropping the listener stops accepting; channels already accepted are
/// unaffected, queued ones are closed.
pub struct Listener {
    port: VirtualPort,
    incoming: mpsc::Receiver<Channel>,
    mux: Arc<MuxInner>,
}

impl Listener {
    pub(crate) fn new(port: VirtualPort, incoming: mpsc::Receiver<Channel>, mux: Arc<MuxInner>) -> Self {
        Self {
            port,
            incoming,
            mux,
        }
    }

    /// Port this listener accepts on
    pub fn port(&self) -> VirtualPort {
        self.port
    }

    /// Wait for the next inbound channel
    ///
    /// Fails with `TransportBroken` once the multiplexer shuts down.
    pub async fn accept(&mut self) -> Result<Channel, MuxError> {
        match self.incoming.recv().await {
            Some(channel) => Ok(channel),
            None => Err(self.mux.broken()),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.mux.unregister_listener(self.port);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("port", &self.port).finish()
    }
}
