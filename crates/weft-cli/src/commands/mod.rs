//! CLI command implementations

mod config;
mod connect;
mod serve;

pub use config::{config_init, config_path, config_show, load_endpoint_config};
pub use connect::{connect_command, ConnectOptions};
pub use serve::serve_command;
