//! Relay services bridging channels and TCP sockets

mod channel_to_socket;
mod pump;
mod socket_to_channel;

use std::sync::Arc;

use weft_core::config::RelayConfig;
use weft_core::error::ServiceError;
use weft_core::{Service, ServiceFactory, ServiceKind, ServiceParameters};
use weft_mux::Multiplexer;

pub use channel_to_socket::ChannelToSocket;
pub use pump::{pump, PumpOutcome};
pub use socket_to_channel::SocketToChannel;

/// What relays need from their connection
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub mux: Multiplexer,
    pub config: RelayConfig,
}

impl RelayContext {
    pub fn new(mux: Multiplexer, config: RelayConfig) -> Self {
        Self { mux, config }
    }
}

/// Builds [`ChannelToSocket`] relays
pub struct ChannelToSocketFactory {
    context: RelayContext,
}

impl ChannelToSocketFactory {
    pub fn new(context: RelayContext) -> Arc<Self> {
        Arc::new(Self { context })
    }
}

impl ServiceFactory for ChannelToSocketFactory {
    fn kind(&self) -> ServiceKind {
        ServiceKind::ChannelToSocket
    }

    fn create(&self, parameters: &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError> {
        Ok(Arc::new(ChannelToSocket::from_parameters(
            self.context.clone(),
            parameters,
        )?))
    }
}

/// Builds [`SocketToChannel`] relays
pub struct SocketToChannelFactory {
    context: RelayContext,
}

impl SocketToChannelFactory {
    pub fn new(context: RelayContext) -> Arc<Self> {
        Arc::new(Self { context })
    }
}

impl ServiceFactory for SocketToChannelFactory {
    fn kind(&self) -> ServiceKind {
        ServiceKind::SocketToChannel
    }

    fn create(&self, parameters: &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError> {
        Ok(Arc::new(SocketToChannel::from_parameters(
            self.context.clone(),
            parameters,
        )?))
    }
}
