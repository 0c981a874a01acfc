//! Core error types for weft

use std::path::PathBuf;

use thiserror::Error;
use weft_protocol::{ProtocolError, VirtualPort};

use crate::types::InstanceId;

/// Top-level error type for the weft ecosystem
#[derive(Error, Debug)]
pub enum WeftError {
    /// Malformed user input (forwarding spec)
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ForwardSpecError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Multiplexer error
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    /// Control request error
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Service error
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors parsing a `[rem_ip:]rem_port:dest_ip:dest_port` forwarding spec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpecError {
    /// Wrong number of `:`-separated fields
    #[error("expected [bind_addr:]bind_port:target_addr:target_port, got {0} fields")]
    FieldCount(usize),

    /// Port is not a number in 1..=65535
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// Target address is empty
    #[error("target address is empty")]
    EmptyAddress,

    /// `[` without matching `]`
    #[error("unterminated '[' in address")]
    UnterminatedBracket,

    /// No user service is registered under this parse name
    #[error("unknown forwarding kind '{0}'")]
    UnknownForwarding(String),
}

/// Multiplexer and channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The local virtual port is already in use
    #[error("Virtual port unavailable: {0}")]
    PortUnavailable(VirtualPort),

    /// The peer refused to open a channel at this port
    #[error("Remote refused channel to {0}")]
    RemoteRefused(VirtualPort),

    /// The physical connection is unusable
    #[error("Transport broken: {0}")]
    TransportBroken(String),

    /// The peer closed the channel
    #[error("Channel closed by peer")]
    ChannelClosed,

    /// The channel was reset
    #[error("Channel reset")]
    ChannelReset,

    /// Write after `close_write`
    #[error("Channel write side already closed")]
    WriteClosed,

    /// The peer sent more than its credit allowed
    #[error("Flow control violation on {port}: {received} bytes exceed remaining window of {allowed}")]
    FlowControlViolation {
        port: VirtualPort,
        received: usize,
        allowed: u32,
    },

    /// No ephemeral virtual port is free
    #[error("No ephemeral virtual ports available")]
    PortsExhausted,

    /// Malformed frame
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for MuxError {
    fn from(err: ProtocolError) -> Self {
        MuxError::Protocol(err.to_string())
    }
}

/// Errors reported to the issuer of a control request
#[derive(Error, Debug)]
pub enum ControlError {
    /// The channel broke before a response arrived; the remote side effect
    /// may or may not have happened. Re-query status instead of retrying.
    #[error("Request outcome indeterminate")]
    Indeterminate,

    /// The instance was created but failed to start
    #[error("Remote service {0} failed to start")]
    StartFailed(InstanceId),

    /// The peer rejected the request
    #[error("Request rejected by peer: {0}")]
    Rejected(String),

    /// Could not reach the peer's control channel
    #[error("Transport error: {0}")]
    Transport(#[from] MuxError),

    /// Malformed control message
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors building or starting a service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Required parameter is absent
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// Parameter value does not parse
    #[error("Invalid parameter {key}={value}")]
    InvalidParameter { key: String, value: String },

    /// Parameter blob could not be (de)serialized
    #[error("Parameter encoding error: {0}")]
    Encoding(String),

    /// Could not bind a local socket
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not listen on a virtual port
    #[error("Failed to listen on virtual port: {0}")]
    Listen(#[from] MuxError),
}

/// Errors from the per-connection service registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No factory registered for this kind
    #[error("Unknown service kind: {0}")]
    UnknownService(u32),

    /// Parameters rejected by the factory
    #[error("Invalid parameters: {0}")]
    InvalidParameters(#[source] ServiceError),

    /// Instance allocated but start failed; it stays registered as failed
    #[error("Service {id} failed to start: {source}")]
    StartFailed {
        id: InstanceId,
        #[source]
        source: ServiceError,
    },

    /// Registry torn down with its connection
    #[error("Registry is shut down")]
    ShutDown,
}

impl RegistryError {
    /// Instance id allocated before the failure, if any
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            RegistryError::StartFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
