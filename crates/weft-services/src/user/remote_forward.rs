//! `-R`: listen on the peer, deliver to a target reachable from here

use async_trait::async_trait;
use weft_core::error::{ControlError, RegistryError};
use weft_core::{
    CreateServiceRequest, ForwardSpec, InstanceId, RemoteServiceStatus, ServiceDescriptor,
    ServiceKind, ServiceParameters, StopServiceRequest,
};

use super::{RelayPair, UserService};
use crate::connection::Connection;

/// Remote port forwarding
///
/// The peer binds `bind_addr:bind_port` and relays each accepted
/// connection over virtual port `bind_port` to us; we connect it to
/// `target_addr:target_port`.
pub struct RemotePortForwarding {
    spec: ForwardSpec,
    pair: RelayPair,
}

impl RemotePortForwarding {
    pub const PARSE_NAME: &'static str = "tcp-remote-forward";

    pub fn new(spec: ForwardSpec) -> Self {
        let relay_port = spec.relay_port().as_u16();
        let remote = ServiceDescriptor::new(
            ServiceKind::SocketToChannel,
            ServiceParameters::new()
                .with("local_addr", &spec.bind_addr)
                .with("local_port", spec.bind_port)
                .with("remote_port", relay_port),
        );
        let local = ServiceDescriptor::new(
            ServiceKind::ChannelToSocket,
            ServiceParameters::new()
                .with("local_port", relay_port)
                .with("remote_addr", &spec.target_addr)
                .with("remote_port", spec.target_port),
        );

        Self {
            spec,
            pair: RelayPair::new(remote, local),
        }
    }

    pub fn spec(&self) -> &ForwardSpec {
        &self.spec
    }

    /// Descriptor of the peer's socket listener
    pub fn remote_descriptor(&self) -> &ServiceDescriptor {
        self.pair.remote()
    }

    /// Descriptor of our channel acceptor
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
impl UserService for RemotePortForwarding {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_from_spec() {
        let forwarding = RemotePortForwarding::new("8080:10.0.0.5:80".parse().unwrap());

        let remote = forwarding.remote_descriptor();
        assert_eq!(remote.kind(), Some(ServiceKind::SocketToChannel));
        assert_eq!(remote.parameters().get("local_addr"), Some("0.0.0.0"));
        assert_eq!(remote.parameters().get("local_port"), Some("8080"));
        assert_eq!(remote.parameters().get("remote_port"), Some("8080"));

        let local = forwarding.local_descriptor();
        assert_eq!(local.kind(), Some(ServiceKind::ChannelToSocket));
        assert_eq!(local.parameters().get("local_port"), Some("8080"));
        assert_eq!(local.parameters().get("remote_addr"), Some("10.0.0.5"));
        assert_eq!(local.parameters().get("remote_port"), Some("80"));
    }

    #[test]
    fn test_create_requests_target_remote_descriptor() {
        let forwarding = RemotePortForwarding::new("127.0.0.1:9000:db:5432".parse().unwrap());
        let requests = forwarding.remote_create_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].descriptor(), forwarding.remote_descriptor());
    }

    #[test]
    fn test_stop_without_resolved_id_is_empty() {
        let forwarding = RemotePortForwarding::new("8080:10.0.0.5:80".parse().unwrap());
        assert!(forwarding.remote_stop_requests().is_empty());
        assert_eq!(forwarding.remote_instance(), None);
    }

    #[test]
    fn test_name() {
        let forwarding = RemotePortForwarding::new("8080:10.0.0.5:80".parse().unwrap());
        assert_eq!(forwarding.name(), "tcp-remote-forward 0.0.0.0:8080:10.0.0.5:80");
    }
}
