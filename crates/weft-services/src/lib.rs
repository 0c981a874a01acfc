//! weft-services: Remote service management and relays for weft
//!
//! A [`Connection`] owns one multiplexer and one [`ServiceRegistry`]. Each
//! peer runs an admin server on the control channel so the other side can
//! create, stop and query relay services in its process. User services
//! (`-R`/`-L` port forwarding) describe which relays to run on each side,
//! and a [`ForwardingSession`] drives them.

pub mod admin;
pub mod connection;
pub mod registry;
pub mod relay;
pub mod session;
pub mod user;

pub use admin::{AdminClient, AdminServer};
pub use connection::Connection;
pub use registry::ServiceRegistry;
pub use session::{ForwardingSession, ServiceReport};
pub use user::{LocalPortForwarding, RemotePortForwarding, UserService, UserServiceFactory};
