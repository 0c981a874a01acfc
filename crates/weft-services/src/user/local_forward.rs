//! `-L`: listen here, deliver to a target reachable from the peer

use async_trait::async_trait;
use weft_core::error::{ControlError, RegistryError};
use weft_core::{
    CreateServiceRequest, ForwardSpec, InstanceId, RemoteServiceStatus, ServiceDescriptor,
    ServiceKind, ServiceParameters, StopServiceRequest,
};

use super::{RelayPair, UserService};
use crate::connection::Connection;

/// Local port forwarding
///
/// We bind `bind_addr:bind_port` and relay each accepted connection over
/// virtual port `bind_port` to the peer, which connects it to
/// `target_addr:target_port`.
pub struct LocalPortForwarding {
    spec: ForwardSpec,
    pair: RelayPair,
}

impl LocalPortForwarding {
    pub const PARSE_NAME: &'static str = "tcp-local-forward";

    pub fn new(spec: ForwardSpec) -> Self {
        let relay_port = spec.relay_port().as_u16();
        let remote = ServiceDescriptor::new(
            ServiceKind::ChannelToSocket,
            ServiceParameters::new()
                .with("local_port", relay_port)
                .with("remote_addr", &spec.target_addr)
                .with("remote_port", spec.target_port),
        );
        let local = ServiceDescriptor::new(
            ServiceKind::SocketToChannel,
            ServiceParameters::new()
                .with("local_addr", &spec.bind_addr)
                .with("local_port", spec.bind_port)
                .with("remote_port", relay_port),
        );

        Self {
            spec,
            pair: RelayPair::new(remote, local),
        }
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Descriptor of the peer's channel acceptor
    pub fn remote_descriptor(&self) -> &ServiceDescriptor {
        self.pair.remote()
    }

    /// Descriptor of our socket listener
    pub fn local_descriptor(&self) -> &ServiceDescriptor {
        self.pair.local()
    }

    pub fn remote_instance(&self) -> Option<InstanceId> {
        self.pair.remote_id()
    }

    pub fn local_instance(&self) -> Option<InstanceId> {
        self.pair.local_id()
    }
}

#[async_trait]
impl UserService for LocalPortForwarding {
    fn name(&self) -> String {
        format!("{} {}", Self::PARSE_NAME, self.spec)
    }

    fn remote_create_requests(&self) -> Vec<CreateServiceRequest> {
        self.pair.create_requests()
    }

    fn remote_stop_requests(&self) -> Vec<StopServiceRequest> {
        self.pair.stop_requests()
    }

    async fn start_local_services(&mut self, connection: &Connection) -> Result<(), RegistryError> {
        self.pair.start_local(connection).await
    }

    async fn check_remote_status(
        &mut self,
        connection: &Connection,
    ) -> Result<RemoteServiceStatus, ControlError> {
        self.pair.check_remote(connection).await
    }

    async fn stop_local_services(&mut self, connection: &Connection) {
        self.pair.stop_local(connection).await
    }
}
