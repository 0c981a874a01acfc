//! Lookup of user service kinds by parse name

use weft_core::error::ForwardSpecError;
use weft_core::{ForwardSpec, WeftError};

use super::{LocalPortForwarding, RemotePortForwarding, UserService};

/// Describes one forwarding kind the command line can build
#[derive(Debug, Clone, Copy)]
pub struct UserServiceInfo {
    /// Name used to look the kind up, e.g. `tcp-remote-forward`
    pub parse_name: &'static str,
    /// Parse name plus its short flag, e.g. `tcp-remote-forward,R`
    pub full_parse_name: &'static str,
    /// Placeholder for the value in help output
    pub value_name: &'static str,
    pub description: &'static str,
    build: fn(ForwardSpec) -> Box<dyn UserService>,
}

impl UserServiceInfo {
    /// Short flag, the part of the full parse name after the comma
    pub fn short_name(&self) -> Option<&'static str> {
        self.full_parse_name.split_once(',').map(|(_, short)| short)
    }

    fn matches(&self, name: &str) -> bool {
        self.parse_name == name || self.short_name() == Some(name)
    }
}

/// `-R`: listen on the peer, deliver from here
pub const REMOTE_FORWARD: UserServiceInfo = UserServiceInfo {
    parse_name: RemotePortForwarding::PARSE_NAME,
    full_parse_name: "tcp-remote-forward,R",
    value_name: "[rem_ip:]rem_port:dest_ip:dest_port",
    description: "Forward a port on the peer to a destination reachable from here",
    build: build_remote,
};

/// `-L`: listen here, deliver from the peer
pub const LOCAL_FORWARD: UserServiceInfo = UserServiceInfo {
    parse_name: LocalPortForwarding::PARSE_NAME,
    full_parse_name: "tcp-local-forward,L",
    value_name: "[loc_ip:]loc_port:dest_ip:dest_port",
    description: "Forward a local port to a destination reachable from the peer",
    build: build_local,
};

/// Builds user services from a parse name and a value
pub struct UserServiceFactory {
    kinds: Vec<UserServiceInfo>,
}

impl UserServiceFactory {
    /// Factory knowing the built-in forwarding kinds
    pub fn new() -> Self {
        Self {
            kinds: vec![REMOTE_FORWARD, LOCAL_FORWARD],
        }
    }

    /// Known kinds in registration order
    pub fn kinds(&self) -> &[UserServiceInfo] {
        &self.kinds
    }

    /// Find a kind by parse name or short flag
    pub fn lookup(&self, name: &str) -> Option<&UserServiceInfo> {
        self.kinds.iter().find(|info| info.matches(name))
    }

    /// Parse `value` and build the user service registered as `name`
    pub fn create(&self, name: &str, value: &str) -> Result<Box<dyn UserService>, WeftError> {
        let info = self
            .lookup(name)
            .ok_or_else(|| ForwardSpecError::UnknownForwarding(name.to_string()))?;
        let spec: ForwardSpec = value.parse()?;
        Ok((info.build)(spec))
    }
}

fn build_remote(spec: ForwardSpec) -> Box<dyn UserService> {
    Box::new(RemotePortForwarding::new(spec))
}

fn build_local(spec: ForwardSpec) -> Box<dyn UserService> {
    Box::new(LocalPortForwarding::new(spec))
}

impl Default for UserServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_flag() {
        let factory = UserServiceFactory::new();
        assert_eq!(
            factory.lookup("R").map(|i| i.parse_name),
            Some("tcp-remote-forward")
        );
        assert_eq!(
            factory.lookup("tcp-local-forward").and_then(|i| i.short_name()),
            Some("L")
        );
        assert!(factory.lookup("socks").is_none());
    }

    #[test]
    fn test_builtin_kinds_match_their_flags() {
        assert_eq!(REMOTE_FORWARD.short_name(), Some("R"));
        assert_eq!(LOCAL_FORWARD.short_name(), Some("L"));
        assert!(REMOTE_FORWARD.value_name.contains("rem_port"));
        assert!(LOCAL_FORWARD.value_name.contains("loc_port"));
    }

    #[test]
    fn test_create() {
        let factory = UserServiceFactory::new();
        let service = factory.create("tcp-remote-forward", "8080:10.0.0.5:80").unwrap();
        assert_eq!(service.name(), "tcp-remote-forward 0.0.0.0:8080:10.0.0.5:80");
        assert_eq!(service.remote_create_requests().len(), 1);
    }

    #[test]
    fn test_malformed_value_is_invalid_argument() {
        let factory = UserServiceFactory::new();
        let err = factory.create("R", "abc").err().unwrap();
        assert!(matches!(err, WeftError::InvalidArgument(_)));
        assert!(err.to_string().starts_with("Invalid argument"));
    }

    #[test]
    fn test_unknown_kind() {
        let factory = UserServiceFactory::new();
        let err = factory.create("socks", "1080").err().unwrap();
        assert!(matches!(
            err,
            WeftError::InvalidArgument(ForwardSpecError::UnknownForwarding(_))
        ));
    }
}
