//! Relay from a local TCP listener into channels opened toward the peer

use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::error::ServiceError;
use weft_core::{Service, ServiceKind, ServiceParameters, StatusReporter};
use weft_protocol::VirtualPort;

use super::pump::{abort_socket, pump, PumpOutcome};
use super::RelayContext;

/// Accepts TCP connections and relays each over a new channel to the
/// peer's `remote_port`
///
/// Parameters: `local_addr`, `local_port`, `remote_port`.
pub struct SocketToChannel {
    context: RelayContext,
    bind_addr: String,
    bind_port: u16,
    remote_port: VirtualPort,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketToChannel {
    pub fn from_parameters(
        context: RelayContext,
        parameters: &ServiceParameters,
    ) -> Result<Self, ServiceError> {
        let bind_addr = parameters.require("local_addr")?.to_string();
        let bind_port: u16 = parameters.parse("local_port")?;
        let remote_port: u16 = parameters.parse("remote_port")?;
        if remote_port == 0 {
            return Err(ServiceError::InvalidParameter {
                key: "remote_port".to_string(),
                value: remote_port.to_string(),
            });
        }

        Ok(Self {
            context,
            bind_addr,
            bind_port,
            remote_port: VirtualPort::new(remote_port),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Service for SocketToChannel {
    fn kind(&self) -> ServiceKind {
        ServiceKind::SocketToChannel
    }

    async fn start(&self, status: StatusReporter) -> Result<(), ServiceError> {
        let address = format!("{}:{}", self.bind_addr, self.bind_port);
        let listener = TcpListener::bind((self.bind_addr.as_str(), self.bind_port))
            .await
            .map_err(|source| ServiceError::Bind {
                address: address.clone(),
                source,
            })?;

        let local_addr = listener.local_addr().ok();
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = local_addr;
        info!("Relaying {} to peer {}", address, self.remote_port);

        let task = tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            self.remote_port,
            self.cancel.clone(),
            status,
        ));
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    /// Returns once the listening socket is closed
    async fn stop(&self) {
        debug!("Stopping relay {}:{}", self.bind_addr, self.bind_port);
        self.cancel.cancel();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: RelayContext,
    remote_port: VirtualPort,
    cancel: CancellationToken,
    status: StatusReporter,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed on {:?}: {}", listener.local_addr().ok(), e);
                    status.failed();
                    break;
                }
            },
        };

        debug!("Accepted {} for {}", peer, remote_port);
        let context = context.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            relay_connection(socket, peer, context, remote_port, cancel).await;
        });
    }
}

async fn relay_connection(
    socket: TcpStream,
    peer: SocketAddr,
    context: RelayContext,
    remote_port: VirtualPort,
    cancel: CancellationToken,
) {
    let channel = tokio::select! {
        _ = cancel.cancelled() => {
            abort_socket(&socket);
            return;
        }
        result = context.mux.open(remote_port) => result,
    };

    let channel = match channel {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Dropping {}: could not open {}: {}", peer, remote_port, e);
            abort_socket(&socket);
            return;
        }
    };

    let local = channel.local_port();
    match pump(socket, channel, &cancel, context.config.buffer_size).await {
        PumpOutcome::Completed => debug!("Relay {} via {} finished", peer, local),
        PumpOutcome::Cancelled => debug!("Relay {} via {} cancelled", peer, local),
        outcome => debug!("Relay {} via {} aborted: {:?}", peer, local, outcome),
    }
}
