//! Relay from channels the peer opens into outbound TCP connections

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::error::ServiceError;
use weft_core::{Service, ServiceKind, ServiceParameters, StatusReporter};
use weft_mux::{Channel, Listener};
use weft_protocol::VirtualPort;

use super::pump::{pump, PumpOutcome};
use super::RelayContext;

/// Accepts channels at `local_port` and connects each to the target
///
/// Parameters: `local_port`, `remote_addr`, `remote_port`. A target that
/// cannot be reached resets the channel so the originating client is
/// disconnected right away.
pub struct ChannelToSocket {
    context: RelayContext,
    listen_port: VirtualPort,
    target_addr: String,
    target_port: u16,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelToSocket {
    pub fn from_parameters(
        context: RelayContext,
        parameters: &ServiceParameters,
    ) -> Result<Self, ServiceError> {
        let listen_port: u16 = parameters.parse("local_port")?;
        if listen_port == 0 {
            return Err(ServiceError::InvalidParameter {
                key: "local_port".to_string(),
                value: listen_port.to_string(),
            });
        }
        let target_addr = parameters.require("remote_addr")?;
        if target_addr.is_empty() {
            return Err(ServiceError::InvalidParameter {
                key: "remote_addr".to_string(),
                value: String::new(),
            });
        }

        Ok(Self {
            context,
            listen_port: VirtualPort::new(listen_port),
            target_addr: target_addr.to_string(),
            target_port: parameters.parse("remote_port")?,
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        })
    }

    fn target(&self) -> Target {
        Target {
            addr: self.target_addr.clone(),
            port: self.target_port,
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    addr: String,
    port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

#[async_trait]
impl Service for ChannelToSocket {
    fn kind(&self) -> ServiceKind {
        ServiceKind::ChannelToSocket
    }

    async fn start(&self, status: StatusReporter) -> Result<(), ServiceError> {
        let listener = self.context.mux.listen(self.listen_port)?;
        info!("Relaying {} to {}", self.listen_port, self.target());

        let task = tokio::spawn(accept_loop(
            listener,
            self.context.clone(),
            self.target(),
            self.cancel.clone(),
            status,
        ));
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    /// Returns once the virtual port is free again
    async fn stop(&self) {
        debug!("Stopping relay {}", self.listen_port);
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
    mut listener: Listener,
    context: RelayContext,
    target: Target,
    cancel: CancellationToken,
    status: StatusReporter,
) {
    let port = listener.port();
    loop {
        let channel = tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok(channel) => channel,
                Err(e) => {
                    // The connection is going away; the registry reports it
                    debug!("Listener {} closed: {}", port, e);
                    status.failed();
                    break;
                }
            },
        };

        let context = context.clone();
        let target = target.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            relay_channel(channel, context, target, cancel).await;
        });
    }
}

async fn relay_channel(
    channel: Channel,
    context: RelayContext,
    target: Target,
    cancel: CancellationToken,
) {
    let remote = channel.remote_port();
    let connect = tokio::time::timeout(
        context.config.connect_timeout,
        TcpStream::connect((target.addr.as_str(), target.port)),
    );

    let socket = tokio::select! {
        _ = cancel.cancelled() => {
            channel.reset();
            return;
        }
        result = connect => result,
    };

    let socket = match socket {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!("Connect to {} for {} failed: {}", target, remote, e);
            channel.reset();
            return;
        }
        Err(_) => {
            warn!(
                "Connect to {} for {} timed out after {:?}",
                target, remote, context.config.connect_timeout
            );
            channel.reset();
            return;
        }
    };

    let _ = socket.set_nodelay(true);
    match pump(socket, channel, &cancel, context.config.buffer_size).await {
        PumpOutcome::Completed => debug!("Relay {} to {} finished", remote, target),
        PumpOutcome::Cancelled => debug!("Relay {} to {} cancelled", remote, target),
        outcome => debug!("Relay {} to {} aborted: {:?}", remote, target, outcome),
    }
}
