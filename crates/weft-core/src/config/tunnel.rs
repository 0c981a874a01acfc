//! Per-connection tunnel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Settings shared by both peers of a connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Multiplexer settings
    pub mux: MuxConfig,

    /// Control protocol settings
    pub control: ControlConfig,

    /// Relay service settings
    pub relay: RelayConfig,
}

impl TunnelConfig {
    /// Check that the settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mux.validate()?;
        self.control.validate()?;
        self.relay.validate()
    }
}

/// Multiplexer flow-control and framing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Receive window advertised per channel, in bytes
    pub window_size: u32,

    /// Largest data payload per frame
    pub max_frame_payload: u32,

    /// Inbound channels queued per listener before opens are refused
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window_size: 256 * 1024,
            max_frame_payload: 16 * 1024,
            accept_backlog: 64,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_payload == 0 {
            return Err(ConfigError::Invalid(
                "mux.max_frame_payload must be positive".to_string(),
            ));
        }
        if self.max_frame_payload as usize > weft_protocol::MAX_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid(format!(
                "mux.max_frame_payload exceeds {} bytes",
                weft_protocol::MAX_PAYLOAD_SIZE
            )));
        }
        if self.window_size < self.max_frame_payload {
            return Err(ConfigError::Invalid(format!(
                "mux.window_size ({}) is smaller than one frame ({})",
                self.window_size, self.max_frame_payload
            )));
        }
        if self.accept_backlog == 0 {
            return Err(ConfigError::Invalid(
                "mux.accept_backlog must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Control protocol timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// How long a request waits for its response before it is indeterminate
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Delay between remote status polls
    #[serde(with = "duration_millis")]
    pub status_poll_interval: Duration,

    /// Polls before a still-starting remote service is reported as is
    pub status_poll_attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            status_poll_interval: Duration::from_millis(500),
            status_poll_attempts: 20,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "control.request_timeout must be positive".to_string(),
            ));
        }
        if self.status_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "control.status_poll_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relay copy-loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Timeout for outbound connects to a relay target
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Socket read buffer per relayed connection
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer_size: 16 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "relay.buffer_size must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "relay.connect_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
