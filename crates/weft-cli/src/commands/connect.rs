//! `weft connect`: dial a peer and set up forwardings

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tracing::{debug, info};
use weft_core::EndpointConfig;
use weft_services::{Connection, ForwardingSession, UserServiceFactory};

use crate::output::{format_reports, format_reports_json, print_info, print_success, print_warning};

/// Command-line overrides for `connect`
#[derive(Debug, Default, Clone)]
pub struct ConnectOptions {
    pub server: Option<String>,
    pub remote_forwards: Vec<String>,
    pub local_forwards: Vec<String>,
    pub json: bool,
}

/// Connect, start every forwarding, report, and hold the tunnel open until
/// Ctrl-C or connection loss
pub async fn connect_command(config: EndpointConfig, options: ConnectOptions) -> Result<()> {
    let remote_forwards: Vec<String> = config
        .remote_forwards
        .iter()
        .chain(&options.remote_forwards)
        .cloned()
        .collect();
    let local_forwards: Vec<String> = config
        .local_forwards
        .iter()
        .chain(&options.local_forwards)
        .cloned()
        .collect();

    // Every spec must parse before anything touches the network
    let factory = UserServiceFactory::new();
    let mut session = ForwardingSession::from_specs(&factory, &remote_forwards, &local_forwards)?;
    if session.is_empty() {
        print_warning("No forwardings requested; the tunnel will only carry control traffic");
    }

    let Some(server) = options.server.or(config.server_address) else {
        bail!("No server address: pass --server or set server_address in the config file");
    };

    info!("Connecting to {}", server);
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(server.as_str()))
        .await
        .with_context(|| format!("Timed out connecting to {}", server))?
        .with_context(|| format!("Failed to connect to {}", server))?;
    stream.set_nodelay(true).ok();

    let connection = Connection::establish(stream, config.tunnel)?;
    print_success(&format!("Connected to {}", server));

    let reports = session.start(&connection).await;
    if options.json {
        println!("{}", format_reports_json(&reports)?);
    } else {
        println!("{}", format_reports(&reports));
    }
    let failed = reports.iter().filter(|r| !r.is_healthy()).count();
    if failed > 0 {
        print_warning(&format!("{} of {} forwardings not healthy", failed, reports.len()));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            print_info("Shutting down");
            session.stop(&connection).await;
            connection.close().await;
        }
        _ = connection.closed() => {
            let reason = connection.close_reason().unwrap_or_default();
            print_warning(&format!("Connection lost: {}", reason));
            // Local instances were torn down with the connection
            connection.close().await;
        }
    }

    debug!("Connect command finished");
    Ok(())
}
