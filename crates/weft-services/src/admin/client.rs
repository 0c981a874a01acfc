//! Control request issuer

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};
use weft_core::config::ControlConfig;
use weft_core::error::ControlError;
use weft_core::{
    CreateServiceRequest, InstanceId, RemoteServiceStatus, ServiceDescriptor, StopServiceRequest,
};
use weft_mux::{ChannelReader, ChannelWriter, Multiplexer};
use weft_protocol::{ControlCodec, ControlMessage, ResponseCode, VirtualPort};

use super::pending::{ControlResponse, PendingRequests};

/// Sends control requests to the peer's admin server
///
/// The control channel is opened on first use and shared by concurrent
/// requests. If it breaks, requests in flight resolve to
/// [`ControlError::Indeterminate`] and the next request opens a new one.
pub struct AdminClient {
    mux: Multiplexer,
    config: ControlConfig,
    link: Arc<Mutex<Option<ControlLink>>>,
    pending: PendingRequests,
    next_correlation: AtomicU32,
    next_generation: AtomicU64,
}

/// The open control channel; `generation` tells reopened channels apart
struct ControlLink {
    generation: u64,
    writer: ChannelWriter,
}

impl AdminClient {
    pub fn new(mux: Multiplexer, config: ControlConfig) -> Self {
        Self {
            mux,
            config,
            link: Arc::new(Mutex::new(None)),
            pending: PendingRequests::new(),
            next_correlation: AtomicU32::new(1),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Ask the peer to create (or look up) a service
    pub async fn create_service(
        &self,
        request: &CreateServiceRequest,
    ) -> Result<InstanceId, ControlError> {
        let descriptor = request.descriptor();
        let parameters = descriptor
            .parameters()
            .to_blob()
            .map_err(|e| ControlError::Rejected(e.to_string()))?;

        let response = self
            .request(|correlation_id| ControlMessage::Create {
                correlation_id,
                service_kind: descriptor.kind_id(),
                parameters: parameters.clone(),
            })
            .await?;

        let id = InstanceId::from_wire(response.instance_id);
        match (decode_status(response.status)?, id) {
            (ResponseCode::Ok, Some(id)) => Ok(id),
            (ResponseCode::StartFailed, Some(id)) => Err(ControlError::StartFailed(id)),
            (code, _) => Err(rejection(code, descriptor)),
        }
    }

    /// Ask the peer to stop an instance; an instance it no longer has is
    /// not an error
    pub async fn stop_service(&self, request: StopServiceRequest) -> Result<(), ControlError> {
        let instance_id = request.instance_id().as_u32();
        let response = self
            .request(|correlation_id| ControlMessage::Stop {
                correlation_id,
                instance_id,
            })
            .await?;

        match decode_status(response.status)? {
            ResponseCode::Ok | ResponseCode::NotFound => Ok(()),
            code => Err(ControlError::Rejected(format!(
                "stop of {} answered {:?}",
                request.instance_id(),
                code
            ))),
        }
    }

    /// Ask the peer for the status of the instance matching `descriptor`
    pub async fn query_status(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<(RemoteServiceStatus, Option<InstanceId>), ControlError> {
        let parameters = descriptor
            .parameters()
            .to_blob()
            .map_err(|e| ControlError::Rejected(e.to_string()))?;

        let response = self
            .request(|correlation_id| ControlMessage::QueryStatus {
                correlation_id,
                service_kind: descriptor.kind_id(),
                parameters: parameters.clone(),
            })
            .await?;

        let code = decode_status(response.status)?;
        match RemoteServiceStatus::from_response(code) {
            Some(status) => Ok((status, InstanceId::from_wire(response.instance_id))),
            None => Err(rejection(code, descriptor)),
        }
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    async fn request(
        &self,
        build: impl FnOnce(u32) -> ControlMessage,
    ) -> Result<ControlResponse, ControlError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let message = build(correlation_id);
        trace!("Control request {:?}", message.kind());

        let rx = self.send(correlation_id, message).await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                debug!("Control request {} lost with its channel", correlation_id);
                Err(ControlError::Indeterminate)
            }
            Err(_) => {
                warn!(
                    "Control request {} timed out after {:?}",
                    correlation_id, self.config.request_timeout
                );
                self.pending.cancel(correlation_id);
                Err(ControlError::Indeterminate)
            }
        }
    }

    /// Write a request, registering it against the channel it goes out on
    async fn send(
        &self,
        correlation_id: u32,
        message: ControlMessage,
    ) -> Result<oneshot::Receiver<ControlResponse>, ControlError> {
        let mut buf = BytesMut::new();
        ControlCodec::new().encode(message, &mut buf)?;

        let mut link = self.link.lock().await;
        if link.is_none() {
            // Nothing sent yet, so a failure to open is a definite failure
            let channel = self.mux.open(VirtualPort::CONTROL).await?;
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Control channel {} open from {}",
                generation,
                channel.local_port()
            );
            let (reader, writer) = channel.into_split();
            tokio::spawn(read_responses(
                reader,
                generation,
                Arc::clone(&self.link),
                self.pending.clone(),
            ));
            *link = Some(ControlLink { generation, writer });
        }

        let Some(current) = link.as_ref() else {
            return Err(ControlError::Indeterminate);
        };
        let rx = self.pending.register(correlation_id, current.generation);
        if let Err(e) = current.writer.send(buf.freeze()).await {
            warn!("Control channel send failed: {}", e);
            self.pending.cancel(correlation_id);
            *link = None;
            return Err(ControlError::Indeterminate);
        }
        Ok(rx)
    }
}

fn decode_status(status: u32) -> Result<ResponseCode, ControlError> {
    ResponseCode::from_u32(status)
        .ok_or_else(|| ControlError::Rejected(format!("unknown status code {}", status)))
}

fn rejection(code: ResponseCode, descriptor: &ServiceDescriptor) -> ControlError {
    match code {
        ResponseCode::UnknownService => {
            ControlError::Rejected(format!("peer has no service kind {}", descriptor.kind_id()))
        }
        ResponseCode::InvalidParameters => {
            ControlError::Rejected(format!("peer rejected parameters of {}", descriptor))
        }
        other => ControlError::Rejected(format!("{} answered {:?}", descriptor, other)),
    }
}

/// Route responses until the channel ends, then retire it so the next
/// request opens a fresh one
async fn read_responses(
    mut reader: ChannelReader,
    generation: u64,
    link: Arc<Mutex<Option<ControlLink>>>,
    pending: PendingRequests,
) {
    let mut codec = ControlCodec::new();
    let mut buffer = BytesMut::new();

    'outer: loop {
        let chunk = match reader.recv().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                debug!("Control channel closed: {}", e);
                break;
            }
        };
        buffer.extend_from_slice(&chunk);

        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(ControlMessage::Response {
                    correlation_id,
                    status,
                    instance_id,
                })) => {
                    pending.respond(
                        correlation_id,
                        ControlResponse {
                            status,
                            instance_id,
                        },
                    );
                }
                Ok(Some(other)) => {
                    warn!("Unexpected {:?} on control channel", other.kind());
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed control response: {}", e);
                    reader.reset();
                    break 'outer;
                }
            }
        }
    }

    {
        let mut link = link.lock().await;
        if link.as_ref().map(|current| current.generation) == Some(generation) {
            *link = None;
        }
    }
    pending.fail_channel(generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_core::{ServiceKind, ServiceParameters};
    use weft_mux::MuxConfig;

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(
            ServiceKind::ChannelToSocket,
            ServiceParameters::new()
                .with("local_port", 7200)
                .with("remote_addr", "127.0.0.1")
                .with("remote_port", 7201),
        )
    }

    #[tokio::test]
    async fn test_reopens_control_channel_after_loss() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mux = Multiplexer::new(a, MuxConfig::default());
        let peer = Multiplexer::new(b, MuxConfig::default());
        let mut control = peer.listen(VirtualPort::CONTROL).unwrap();

        tokio::spawn(async move {
            let _peer = peer;

            // Swallow the first request and drop the channel
            let mut first = control.accept().await.unwrap();
            let _ = first.recv().await;
            first.reset();

            // Answer everything on the next one
            let mut second = control.accept().await.unwrap();
            let mut codec = ControlCodec::new();
            let mut buffer = BytesMut::new();
            while let Ok(Some(chunk)) = second.recv().await {
                buffer.extend_from_slice(&chunk);
                while let Some(request) = codec.decode(&mut buffer).unwrap() {
                    let mut out = BytesMut::new();
                    codec
                        .encode(request.respond(ResponseCode::NotFound, 0), &mut out)
                        .unwrap();
                    second.send(out.freeze()).await.unwrap();
                }
            }
        });

        let config = ControlConfig {
            request_timeout: Duration::from_secs(5),
            ..ControlConfig::default()
        };
        let client = AdminClient::new(mux, config);

        let lost = client.query_status(&descriptor()).await;
        assert!(matches!(lost, Err(ControlError::Indeterminate)), "{:?}", lost);
        assert_eq!(client.pending_count(), 0);

        let (status, id) = client.query_status(&descriptor()).await.unwrap();
        assert_eq!(status, RemoteServiceStatus::NotFound);
        assert_eq!(id, None);
    }
}
