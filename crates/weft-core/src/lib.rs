//! weft-core: Core abstractions and configuration for weft
//!
//! This crate provides the service vocabulary (kinds, descriptors, instance
//! ids, statuses), forwarding spec parsing, the error taxonomy, and the
//! configuration structures shared by the multiplexer, the services and the
//! command-line binary.

pub mod config;
pub mod error;
pub mod forward;
pub mod traits;
pub mod types;

pub use config::{EndpointConfig, TunnelConfig};
pub use error::WeftError;
pub use forward::ForwardSpec;
pub use traits::{Service, ServiceFactory, StatusReporter};
pub use types::{
    CreateServiceRequest, InstanceId, RemoteServiceStatus, ServiceDescriptor, ServiceKind,
    ServiceParameters, ServiceStatus, StopServiceRequest,
};
