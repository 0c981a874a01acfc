//! Forwarding spec parsing
//!
//! A forwarding spec is written `[bind_addr:]bind_port:target_addr:target_port`.
//! IPv6 addresses are wrapped in brackets (`[::1]:8080:[fe80::1]:80`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use weft_protocol::VirtualPort;

use crate::error::ForwardSpecError;

/// Bind address used when none is given
pub const WILDCARD_ADDRESS: &str = "0.0.0.0";

/// A parsed forwarding spec
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardSpec {
    /// Address the listening side binds to
    pub bind_addr: String,
    /// Port the listening side binds to
    pub bind_port: u16,
    /// Address connections are relayed to
    pub target_addr: String,
    /// Port connections are relayed to
    pub target_port: u16,
}

impl ForwardSpec {
    /// Create a spec from its four components
    pub fn new(
        bind_addr: impl Into<String>,
        bind_port: u16,
        target_addr: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            target_addr: target_addr.into(),
            target_port,
        }
    }

    /// Virtual port carrying the relayed connections.
    ///
    /// This is the bind port by convention. Two forwardings that bind the
    /// same port on different addresses collide on one virtual port; the
    /// second listener registration fails with `PortUnavailable`.
    pub fn relay_port(&self) -> VirtualPort {
        VirtualPort::new(self.bind_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = ForwardSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = split_fields(s)?;

        let (bind_addr, bind_port, target_addr, target_port) = match fields.as_slice() {
            [bind_port, target_addr, target_port] => {
                (WILDCARD_ADDRESS, *bind_port, *target_addr, *target_port)
            }
            [bind_addr, bind_port, target_addr, target_port] => {
                let bind_addr = if bind_addr.is_empty() {
                    WILDCARD_ADDRESS
                } else {
                    *bind_addr
                };
                (bind_addr, *bind_port, *target_addr, *target_port)
            }
            other => return Err(ForwardSpecError::FieldCount(other.len())),
        };

        if target_addr.is_empty() {
            return Err(ForwardSpecError::EmptyAddress);
        }

        Ok(Self {
            bind_addr: bind_addr.to_string(),
            bind_port: parse_port(bind_port)?,
            target_addr: target_addr.to_string(),
            target_port: parse_port(target_port)?,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            bracketed(&self.bind_addr),
            self.bind_port,
            bracketed(&self.target_addr),
            self.target_port
        )
    }
}

fn bracketed(addr: &str) -> String {
    if addr.contains(':') {
        format!("[{}]", addr)
    } else {
        addr.to_string()
    }
}

fn parse_port(field: &str) -> Result<u16, ForwardSpecError> {
    match field.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ForwardSpecError::InvalidPort(field.to_string())),
    }
}

/// Split on `:` outside brackets, stripping the brackets themselves
fn split_fields(s: &str) -> Result<Vec<&str>, ForwardSpecError> {
    let mut fields = Vec::new();
    let mut rest = s;

    loop {
        if let Some(inner) = rest.strip_prefix('[') {
            let end = inner.find(']').ok_or(ForwardSpecError::UnterminatedBracket)?;
            fields.push(&inner[..end]);
            rest = &inner[end + 1..];
            match rest.strip_prefix(':') {
                Some(next) => rest = next,
                None if rest.is_empty() => break,
                None => return Err(ForwardSpecError::FieldCount(fields.len() + 1)),
            }
        } else {
            match rest.find(':') {
                Some(idx) => {
                    fields.push(&rest[..idx]);
                    rest = &rest[idx + 1..];
                }
                None => {
                    fields.push(rest);
                    break;
                }
            }
        }
    }

    Ok(fields)
}
