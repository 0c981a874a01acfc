//! Control request handler
//!
//! Accepts control channels from the peer and dispatches their requests
//! into the connection's registry. Requests on one channel are answered in
//! order.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::error::{MuxError, RegistryError};
use weft_core::{InstanceId, ServiceDescriptor, ServiceParameters, ServiceStatus};
use weft_mux::{Channel, Listener, Multiplexer};
use weft_protocol::{ControlCodec, ControlMessage, ResponseCode, VirtualPort};

use crate::registry::ServiceRegistry;

/// Serves the peer's control requests against a registry
pub struct AdminServer {
    registry: Arc<ServiceRegistry>,
}

impl AdminServer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    /// Listen on the control port and serve until `cancel` fires or the
    /// multiplexer closes
    pub fn spawn(
        self,
        mux: &Multiplexer,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, MuxError> {
        let listener = mux.listen(VirtualPort::CONTROL)?;
        let server = Arc::new(self);
        Ok(tokio::spawn(server.run(listener, cancel)))
    }

    async fn run(self: Arc<Self>, mut listener: Listener, cancel: CancellationToken) {
        info!("Admin server listening on {}", listener.port());

        loop {
            let channel = tokio::select! {
                _ = cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok(channel) => channel,
                    Err(e) => {
                        debug!("Admin server stopped: {}", e);
                        break;
                    }
                },
            };

            debug!("Control channel from {}", channel.remote_port());
            let server = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = server.serve_channel(channel) => {}
                }
            });
        }
    }

    async fn serve_channel(&self, mut channel: Channel) {
        let mut codec = ControlCodec::new();
        let mut buffer = BytesMut::new();

        loop {
            let chunk = match channel.recv().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    debug!("Control channel {} ended: {}", channel.remote_port(), e);
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            loop {
                let request = match codec.decode(&mut buffer) {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Malformed control request: {}", e);
                        channel.reset();
                        return;
                    }
                };

                let Some(response) = self.handle(request).await else {
                    continue;
                };

                let mut out = BytesMut::new();
                if let Err(e) = codec.encode(response, &mut out) {
                    warn!("Failed to encode control response: {}", e);
                    continue;
                }
                if let Err(e) = channel.send(out.freeze()).await {
                    debug!("Control response lost: {}", e);
                    return;
                }
            }
        }
    }

    /// Apply one request; `None` for messages that need no answer
    pub async fn handle(&self, request: ControlMessage) -> Option<ControlMessage> {
        let response = match &request {
            ControlMessage::Create {
                service_kind,
                parameters,
                ..
            } => match ServiceParameters::from_blob(parameters) {
                Ok(parameters) => {
                    let descriptor = ServiceDescriptor::from_raw(*service_kind, parameters);
                    let (code, id) = self.create(descriptor).await;
                    request.respond(code, id)
                }
                Err(e) => {
                    warn!("Create with undecodable parameters: {}", e);
                    request.respond(ResponseCode::InvalidParameters, 0)
                }
            },
            ControlMessage::Stop { instance_id, .. } => {
                let code = if self.registry.stop(InstanceId::new(*instance_id)).await {
                    ResponseCode::Ok
                } else {
                    ResponseCode::NotFound
                };
                request.respond(code, *instance_id)
            }
            ControlMessage::QueryStatus {
                service_kind,
                parameters,
                ..
            } => match ServiceParameters::from_blob(parameters) {
                Ok(parameters) => {
                    let descriptor = ServiceDescriptor::from_raw(*service_kind, parameters);
                    let (status, id) = self.registry.status(&descriptor);
                    debug!("Status of {}: {}", descriptor, status);
                    request.respond(status.into(), id.map(|id| id.as_u32()).unwrap_or(0))
                }
                Err(_) => request.respond(ResponseCode::InvalidParameters, 0),
            },
            ControlMessage::Response { correlation_id, .. } => {
                warn!("Ignoring response {} sent to admin server", correlation_id);
                return None;
            }
        };
        Some(response)
    }

    async fn create(&self, descriptor: ServiceDescriptor) -> (ResponseCode, u32) {
        match self.registry.create(descriptor).await {
            Ok(id) => match self.registry.status_of(id) {
                Some(ServiceStatus::Failed) => (ResponseCode::StartFailed, id.as_u32()),
                _ => (ResponseCode::Ok, id.as_u32()),
            },
            Err(RegistryError::UnknownService(kind)) => {
                warn!("Create for unknown service kind {}", kind);
                (ResponseCode::UnknownService, 0)
            }
            Err(RegistryError::InvalidParameters(e)) => {
                warn!("Create with invalid parameters: {}", e);
                (ResponseCode::InvalidParameters, 0)
            }
            Err(RegistryError::StartFailed { id, .. }) => (ResponseCode::StartFailed, id.as_u32()),
            Err(RegistryError::ShutDown) => (ResponseCode::Failed, 0),
        }
    }
}
