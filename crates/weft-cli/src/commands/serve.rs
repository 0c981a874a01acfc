//! `weft serve`: accept tunnel connections

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weft_core::{EndpointConfig, TunnelConfig};
use weft_services::Connection;

use crate::output::{print_info, print_success};

/// Accept peers until Ctrl-C, running one connection per peer
pub async fn serve_command(config: EndpointConfig, listen: Option<String>) -> Result<()> {
    let address = listen.unwrap_or(config.listen_address);
    let listener = TcpListener::bind(address.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    let local = listener.local_addr().context("Listener has no address")?;
    print_success(&format!("Listening on {}", local));

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_connections(listener, config.tunnel, shutdown.clone()));

    let signal = tokio::signal::ctrl_c().await;
    print_info("Shutting down");
    shutdown.cancel();
    server.await.context("Server task failed")?;

    signal.context("Failed to listen for Ctrl-C")
}

/// Accept peers until `shutdown` fires, then close every connection and
/// wait for each one's services to stop
pub async fn serve_connections(
    listener: TcpListener,
    tunnel: TunnelConfig,
    shutdown: CancellationToken,
) {
    let mut peers = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Peer connected from {}", peer);
                    peers.spawn(serve_peer(
                        stream,
                        peer.to_string(),
                        tunnel.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            Some(finished) = peers.join_next(), if !peers.is_empty() => {
                if let Err(e) = finished {
                    warn!("Peer task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    if !peers.is_empty() {
        info!("Closing {} peer connections", peers.len());
    }
    while let Some(finished) = peers.join_next().await {
        if let Err(e) = finished {
            warn!("Peer task failed: {}", e);
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    peer: String,
    tunnel: TunnelConfig,
    cancel: CancellationToken,
) {
    stream.set_nodelay(true).ok();
    let connection = match Connection::establish(stream, tunnel) {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to set up connection from {}: {}", peer, e);
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = connection.closed() => {}
    }
    connection.close().await;

    info!(
        "Peer {} disconnected: {}",
        peer,
        connection.close_reason().unwrap_or_default()
    );
}
