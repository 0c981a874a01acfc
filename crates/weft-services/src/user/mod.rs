//! User services: forwarding kinds built from the relay services
//!
//! A user service never touches bytes. It only knows which relays to ask
//! the peer for and which to run locally, and keeps the instance ids it
//! learns so it can tear them down again.

mod factory;
mod local_forward;
mod remote_forward;

use async_trait::async_trait;
use tracing::{debug, error, warn};
use weft_core::error::{ControlError, RegistryError};
use weft_core::{
    CreateServiceRequest, InstanceId, RemoteServiceStatus, ServiceDescriptor, StopServiceRequest,
};

use crate::connection::Connection;

pub use factory::{UserServiceFactory, UserServiceInfo, LOCAL_FORWARD, REMOTE_FORWARD};
pub use local_forward::LocalPortForwarding;
pub use remote_forward::RemotePortForwarding;

/// Common contract of every forwarding kind
#[async_trait]
pub trait UserService: Send + Sync {
    /// Human-readable name, e.g. `tcp-remote-forward 8080:10.0.0.5:80`
    fn name(&self) -> String;

    /// Create requests to send to the peer
    fn remote_create_requests(&self) -> Vec<CreateServiceRequest>;

    /// Stop requests for the remote instances resolved so far.
    ///
    /// Empty until a status query has resolved an instance id.
    fn remote_stop_requests(&self) -> Vec<StopServiceRequest>;

    /// Start the local half in the connection's registry
    async fn start_local_services(&mut self, connection: &Connection) -> Result<(), RegistryError>;

    /// Query the remote half's status, caching its instance id
    async fn check_remote_status(
        &mut self,
        connection: &Connection,
    ) -> Result<RemoteServiceStatus, ControlError>;

    /// Stop the local half; a no-op if it was never started
    async fn stop_local_services(&mut self, connection: &Connection);
}

/// One remote relay paired with one local relay
///
/// Both forwarding directions are this shape; they differ only in which
/// side listens on TCP.
#[derive(Debug, Clone)]
pub(crate) struct RelayPair {
    remote: ServiceDescriptor,
    local: ServiceDescriptor,
    remote_id: Option<InstanceId>,
    local_id: Option<InstanceId>,
}

impl RelayPair {
    pub(crate) fn new(remote: ServiceDescriptor, local: ServiceDescriptor) -> Self {
        Self {
            remote,
            local,
            remote_id: None,
            local_id: None,
        }
    }

    pub(crate) fn remote(&self) -> &ServiceDescriptor {
        &self.remote
    }

    pub(crate) fn local(&self) -> &ServiceDescriptor {
        &self.local
    }

    pub(crate) fn remote_id(&self) -> Option<InstanceId> {
        self.remote_id
    }

    pub(crate) fn local_id(&self) -> Option<InstanceId> {
        self.local_id
    }

    fn create_requests(&self) -> Vec<CreateServiceRequest> {
        vec![CreateServiceRequest::new(self.remote.clone())]
    }

    fn stop_requests(&self) -> Vec<StopServiceRequest> {
        self.remote_id
            .map(StopServiceRequest::new)
            .into_iter()
            .collect()
    }

    async fn start_local(&mut self, connection: &Connection) -> Result<(), RegistryError> {
        match connection.registry().create(self.local.clone()).await {
            Ok(id) => {
                debug!("Local {} is {}", self.local, id);
                self.local_id = Some(id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start local {}: {}", self.local, e);
                // A failed instance stays registered until stopped
                self.local_id = e.instance_id();
                Err(e)
            }
        }
    }

    async fn check_remote(
        &mut self,
        connection: &Connection,
    ) -> Result<RemoteServiceStatus, ControlError> {
        let (status, id) = connection.client().query_status(&self.remote).await?;
        if self.remote_id.is_none() {
            if let Some(id) = id {
                debug!("Remote {} resolved to {}", self.remote, id);
                self.remote_id = Some(id);
            }
        }
        Ok(status)
    }

    async fn stop_local(&mut self, connection: &Connection) {
        if let Some(id) = self.local_id.take() {
            if !connection.registry().stop(id).await {
                warn!("Local {} was already gone", id);
            }
        }
    }
}
