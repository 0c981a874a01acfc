//! Control protocol endpoints
//!
//! Every peer serves control requests on [`VirtualPort::CONTROL`] with an
//! [`AdminServer`] and issues its own through an [`AdminClient`].
//!
//! [`VirtualPort::CONTROL`]: weft_protocol::VirtualPort::CONTROL

mod client;
mod pending;
mod server;

pub use client::AdminClient;
pub use pending::{ControlResponse, PendingRequests};
pub use server::AdminServer;
