//! Virtual port type

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric address of a channel endpoint within one connection.
///
/// Virtual ports live in their own namespace. They may coincide numerically
/// with TCP ports (remote forwarding uses the remote bind port as the relay
/// port) but are never bound to the operating system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct VirtualPort(pub u16);

impl VirtualPort {
    /// Port reserved for the control channel
    pub const CONTROL: VirtualPort = VirtualPort(0);

    /// Create a new virtual port
    pub fn new(port: u16) -> Self {
        Self(port)
    }

    /// Get the raw port number
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether this is the control port
    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

impl fmt::Display for VirtualPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vport-{}", self.0)
    }
}

impl From<u16> for VirtualPort {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_port_display() {
        assert_eq!(format!("{}", VirtualPort::new(8080)), "vport-8080");
    }

    #[test]
    fn test_control_port() {
        assert!(VirtualPort::CONTROL.is_control());
        assert!(!VirtualPort::from(1).is_control());
    }
}
