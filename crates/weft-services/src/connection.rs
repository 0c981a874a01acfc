//! One peer connection and everything scoped to it

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;
use weft_core::{TunnelConfig, WeftError};
use weft_mux::Multiplexer;

use crate::admin::{AdminClient, AdminServer};
use crate::registry::ServiceRegistry;
use crate::relay::{ChannelToSocketFactory, RelayContext, SocketToChannelFactory};

/// A multiplexed connection to one peer
///
/// Owns the multiplexer, this side's service registry, the admin server
/// answering the peer's control requests, and the client issuing ours.
/// When the transport goes away every registered instance is failed and
/// stopped. Dropping the connection closes it.
pub struct Connection {
    mux: Multiplexer,
    registry: Arc<ServiceRegistry>,
    client: AdminClient,
    config: TunnelConfig,
    cancel: CancellationToken,
}

impl Connection {
    /// Start multiplexing over an established transport
    ///
    /// Must be called from within a Tokio runtime.
    pub fn establish<T>(transport: T, config: TunnelConfig) -> Result<Self, WeftError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let mux = Multiplexer::new(transport, config.mux.clone());
        let context = RelayContext::new(mux.clone(), config.relay.clone());
        let registry = Arc::new(
            ServiceRegistry::new()
                .with_factory(ChannelToSocketFactory::new(context.clone()))
                .with_factory(SocketToChannelFactory::new(context)),
        );

        let cancel = CancellationToken::new();
        AdminServer::new(Arc::clone(&registry)).spawn(&mux, cancel.clone())?;
        let client = AdminClient::new(mux.clone(), config.control.clone());

        tokio::spawn(watch_transport(
            mux.clone(),
            Arc::clone(&registry),
            cancel.clone(),
        ));

        info!("Connection established");
        Ok(Self {
            mux,
            registry,
            client,
            config,
            cancel,
        })
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// This side's service registry
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Client for the peer's admin server
    pub fn client(&self) -> &AdminClient {
        &self.client
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Tear down the transport and every service on this side
    pub async fn close(&self) {
        self.cancel.cancel();
        self.mux.close();
        self.registry.shutdown().await;
    }

    /// Wait until the transport has gone away
    pub async fn closed(&self) {
        self.mux.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Why the transport went away, once it has
    pub fn close_reason(&self) -> Option<String> {
        self.mux.close_reason()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.mux.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("mux", &self.mux)
            .field("services", &self.registry.len())
            .finish()
    }
}

async fn watch_transport(
    mux: Multiplexer,
    registry: Arc<ServiceRegistry>,
    cancel: CancellationToken,
) {
    mux.closed().await;
    cancel.cancel();

    let reason = mux.close_reason().unwrap_or_default();
    info!("Connection closed: {}", reason);
    registry.shutdown().await;
}
