//! Core domain types

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use weft_protocol::ResponseCode;

use crate::error::ServiceError;

/// Opaque identifier the registry assigns to a service instance.
///
/// Ids start at 1; 0 never names an instance and is used on the wire for
/// "no instance".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Create a new instance ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Decode a wire value, where 0 means "none"
    pub fn from_wire(id: u32) -> Option<Self> {
        (id != 0).then_some(Self(id))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Service kinds this crate knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ServiceKind {
    /// Accepts inbound channels and connects each to a TCP target
    ChannelToSocket = 1,
    /// Listens on a TCP socket and opens a channel per accepted connection
    SocketToChannel = 2,
}

impl ServiceKind {
    /// Convert to u32
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::ChannelToSocket),
            2 => Some(Self::SocketToChannel),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::ChannelToSocket => write!(f, "channel-to-socket"),
            ServiceKind::SocketToChannel => write!(f, "socket-to-channel"),
        }
    }
}

/// Ordered key/value parameters of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceParameters(BTreeMap<String, String>);

impl ServiceParameters {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Get a raw value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Get a required value
    pub fn require(&self, key: &str) -> Result<&str, ServiceError> {
        self.get(key)
            .ok_or_else(|| ServiceError::MissingParameter(key.to_string()))
    }

    /// Get a required value and parse it
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<T, ServiceError> {
        let value = self.require(key)?;
        value.parse().map_err(|_| ServiceError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Iterate over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode as the blob carried in control messages
    pub fn to_blob(&self) -> Result<Bytes, ServiceError> {
        bincode::serialize(&self.0)
            .map(Bytes::from)
            .map_err(|e| ServiceError::Encoding(e.to_string()))
    }

    /// Decode a control message blob
    pub fn from_blob(blob: &[u8]) -> Result<Self, ServiceError> {
        bincode::deserialize(blob)
            .map(Self)
            .map_err(|e| ServiceError::Encoding(e.to_string()))
    }
}

/// Identifies a specific remotely manageable service: (kind, parameters).
///
/// The kind is kept as its raw id so descriptors received from a peer that
/// runs kinds we do not know can still be represented and answered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    kind_id: u32,
    parameters: ServiceParameters,
}

impl ServiceDescriptor {
    /// Create a descriptor for a known kind
    pub fn new(kind: ServiceKind, parameters: ServiceParameters) -> Self {
        Self {
            kind_id: kind.as_u32(),
            parameters,
        }
    }

    /// Create a descriptor from wire values
    pub fn from_raw(kind_id: u32, parameters: ServiceParameters) -> Self {
        Self {
            kind_id,
            parameters,
        }
    }

    /// Raw kind id
    pub fn kind_id(&self) -> u32 {
        self.kind_id
    }

    /// Kind, if known
    pub fn kind(&self) -> Option<ServiceKind> {
        ServiceKind::from_u32(self.kind_id)
    }

    /// Parameters
    pub fn parameters(&self) -> &ServiceParameters {
        &self.parameters
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}", kind)?,
            None => write!(f, "kind-{}", self.kind_id)?,
        }
        write!(f, "(")?;
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, ")")
    }
}

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Allocated, start not yet attempted
    Unstarted,
    /// Start in progress
    Starting,
    /// Serving
    Running,
    /// Relay error or failed start; stays until explicitly stopped
    Failed,
    /// Terminal
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Unstarted => write!(f, "unstarted"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Failed => write!(f, "failed"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Status of a service as reported by a status query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteServiceStatus {
    NotFound,
    Starting,
    Running,
    Failed,
}

impl RemoteServiceStatus {
    /// Collapse a local lifecycle state into what a query reports
    pub fn from_status(status: Option<ServiceStatus>) -> Self {
        match status {
            None | Some(ServiceStatus::Stopped) => RemoteServiceStatus::NotFound,
            Some(ServiceStatus::Unstarted) | Some(ServiceStatus::Starting) => {
                RemoteServiceStatus::Starting
            }
            Some(ServiceStatus::Running) => RemoteServiceStatus::Running,
            Some(ServiceStatus::Failed) => RemoteServiceStatus::Failed,
        }
    }

    /// Whether polling can stop
    pub fn is_settled(&self) -> bool {
        !matches!(self, RemoteServiceStatus::Starting)
    }

    /// Decode the status carried by a query response
    pub fn from_response(code: ResponseCode) -> Option<Self> {
        match code {
            ResponseCode::NotFound => Some(RemoteServiceStatus::NotFound),
            ResponseCode::Starting => Some(RemoteServiceStatus::Starting),
            ResponseCode::Running => Some(RemoteServiceStatus::Running),
            ResponseCode::Failed => Some(RemoteServiceStatus::Failed),
            _ => None,
        }
    }
}

impl From<RemoteServiceStatus> for ResponseCode {
    fn from(status: RemoteServiceStatus) -> Self {
        match status {
            RemoteServiceStatus::NotFound => ResponseCode::NotFound,
            RemoteServiceStatus::Starting => ResponseCode::Starting,
            RemoteServiceStatus::Running => ResponseCode::Running,
            RemoteServiceStatus::Failed => ResponseCode::Failed,
        }
    }
}

impl fmt::Display for RemoteServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteServiceStatus::NotFound => write!(f, "not-found"),
            RemoteServiceStatus::Starting => write!(f, "starting"),
            RemoteServiceStatus::Running => write!(f, "running"),
            RemoteServiceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Request to create a service on a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServiceRequest {
    descriptor: ServiceDescriptor,
}

impl CreateServiceRequest {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> ServiceDescriptor {
        self.descriptor
    }
}

/// Request to stop a service instance on a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopServiceRequest {
    instance_id: InstanceId,
}

impl StopServiceRequest {
    pub fn new(instance_id: InstanceId) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_from_wire() {
        assert_eq!(InstanceId::from_wire(0), None);
        assert_eq!(InstanceId::from_wire(5), Some(InstanceId::new(5)));
        assert_eq!(format!("{}", InstanceId::new(5)), "instance-5");
    }

    #[test]
    fn test_service_kind_roundtrip() {
        for kind in [ServiceKind::ChannelToSocket, ServiceKind::SocketToChannel] {
            assert_eq!(ServiceKind::from_u32(kind.as_u32()), Some(kind));
        }
        assert_eq!(ServiceKind::from_u32(99), None);
    }

    #[test]
    fn test_parameters_blob_is_order_independent() {
        let a = ServiceParameters::new()
            .with("local_port", 8080)
            .with("local_addr", "0.0.0.0");
        let b = ServiceParameters::new()
            .with("local_addr", "0.0.0.0")
            .with("local_port", 8080);

        assert_eq!(a.to_blob().unwrap(), b.to_blob().unwrap());
        assert_eq!(ServiceParameters::from_blob(&a.to_blob().unwrap()).unwrap(), a);
    }

    #[test]
    fn test_parameters_parse() {
        let params = ServiceParameters::new().with("port", 80).with("bad", "x");

        assert_eq!(params.parse::<u16>("port").unwrap(), 80);
        assert!(matches!(
            params.parse::<u16>("bad"),
            Err(ServiceError::InvalidParameter { .. })
        ));
        assert!(matches!(
            params.parse::<u16>("missing"),
            Err(ServiceError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_descriptor_display() {
        let descriptor = ServiceDescriptor::new(
            ServiceKind::SocketToChannel,
            ServiceParameters::new().with("local_port", 8080),
        );
        assert_eq!(descriptor.to_string(), "socket-to-channel(local_port=8080)");
        assert_eq!(
            ServiceDescriptor::from_raw(9, ServiceParameters::new()).to_string(),
            "kind-9()"
        );
    }

    #[test]
    fn test_remote_status_mapping() {
        assert_eq!(
            RemoteServiceStatus::from_status(None),
            RemoteServiceStatus::NotFound
        );
        assert_eq!(
            RemoteServiceStatus::from_status(Some(ServiceStatus::Stopped)),
            RemoteServiceStatus::NotFound
        );
        assert_eq!(
            RemoteServiceStatus::from_status(Some(ServiceStatus::Unstarted)),
            RemoteServiceStatus::Starting
        );
        assert!(!RemoteServiceStatus::Starting.is_settled());
        assert!(RemoteServiceStatus::Failed.is_settled());
    }

    #[test]
    fn test_remote_status_response_codes() {
        for status in [
            RemoteServiceStatus::NotFound,
            RemoteServiceStatus::Starting,
            RemoteServiceStatus::Running,
            RemoteServiceStatus::Failed,
        ] {
            let code: ResponseCode = status.into();
            assert_eq!(RemoteServiceStatus::from_response(code), Some(status));
        }
        assert_eq!(RemoteServiceStatus::from_response(ResponseCode::Ok), None);
    }
}
