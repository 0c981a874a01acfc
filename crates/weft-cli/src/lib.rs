//! weft: Command-line interface for weft tunnels
//!
//! Provides the `weft` binary: `serve` accepts tunnel connections,
//! `connect` dials one and sets up the requested port forwardings.

pub mod commands;
pub mod output;
