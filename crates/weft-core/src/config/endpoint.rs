//! Endpoint configuration for the weft binary

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::TunnelConfig;
use crate::error::{ConfigError, ForwardSpecError};
use crate::forward::ForwardSpec;

/// Configuration for a weft endpoint (either peer)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Address `weft serve` accepts tunnel connections on
    pub listen_address: String,

    /// Address `weft connect` dials
    pub server_address: Option<String>,

    /// Timeout for establishing the tunnel transport
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Remote forwardings (`-R`) requested on connect
    pub remote_forwards: Vec<String>,

    /// Local forwardings (`-L`) requested on connect
    pub local_forwards: Vec<String>,

    /// Per-connection settings
    pub tunnel: TunnelConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7822".to_string(),
            server_address: None,
            connect_timeout: Duration::from_secs(10),
            remote_forwards: Vec::new(),
            local_forwards: Vec::new(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl EndpointConfig {
    /// Check that the settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunnel.validate()
    }

    /// Parse the configured remote forwardings
    pub fn parsed_remote_forwards(&self) -> Result<Vec<ForwardSpec>, ForwardSpecError> {
        self.remote_forwards.iter().map(|s| s.parse()).collect()
    }

    /// Parse the configured local forwardings
    pub fn parsed_local_forwards(&self) -> Result<Vec<ForwardSpec>, ForwardSpecError> {
        self.local_forwards.iter().map(|s| s.parse()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_toml() {
        let config: EndpointConfig = toml::from_str(
            r#"
            server_address = "gateway.example.com:7822"
            remote_forwards = ["8080:localhost:80"]

            [tunnel.mux]
            window_size = 65536
            "#,
        )
        .unwrap();

        assert_eq!(
            config.server_address.as_deref(),
            Some("gateway.example.com:7822")
        );
        assert_eq!(config.listen_address, "0.0.0.0:7822");
        assert_eq!(config.tunnel.mux.window_size, 65536);
        assert_eq!(
            config.parsed_remote_forwards().unwrap(),
            vec![ForwardSpec::new("0.0.0.0", 8080, "localhost", 80)]
        );
    }

    #[test]
    fn test_bad_forward_in_config() {
        let config = EndpointConfig {
            local_forwards: vec!["nope".to_string()],
            ..Default::default()
        };
        assert!(config.parsed_local_forwards().is_err());
    }
}
