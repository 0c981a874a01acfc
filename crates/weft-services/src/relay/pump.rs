//! Bidirectional copy loop between a TCP socket and a channel

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use weft_core::error::MuxError;
use weft_mux::Channel;

/// How a relayed connection ended
#[derive(Debug)]
pub enum PumpOutcome {
    /// Both directions reached EOF
    Completed,
    /// The channel failed; the socket was aborted with a reset
    ChannelFailed(MuxError),
    /// The socket failed; the channel was reset
    SocketFailed(io::Error),
    /// The owning service stopped
    Cancelled,
}

#[derive(Debug)]
enum Failure {
    Socket(io::Error),
    Channel(MuxError),
}

/// Copy bytes both ways until each side has finished writing
///
/// EOF in one direction is forwarded as a half-close and the other
/// direction keeps flowing. A failure on either side aborts the other one
/// so the far end sees a reset instead of a hang.
pub async fn pump(
    mut socket: TcpStream,
    channel: Channel,
    cancel: &CancellationToken,
    buffer_size: usize,
) -> PumpOutcome {
    let (mut from_channel, to_channel) = channel.into_split();

    let result = {
        let (mut sock_read, mut sock_write) = socket.split();

        let upstream = async {
            let mut buf = BytesMut::with_capacity(buffer_size);
            loop {
                buf.reserve(buffer_size);
                let n = sock_read.read_buf(&mut buf).await.map_err(Failure::Socket)?;
                if n == 0 {
                    trace!("Socket EOF, half-closing {}", to_channel.local_port());
                    to_channel.close_write().map_err(Failure::Channel)?;
                    return Ok::<_, Failure>(());
                }
                to_channel
                    .send(buf.split().freeze())
                    .await
                    .map_err(Failure::Channel)?;
            }
        };

        let downstream = async {
            loop {
                match from_channel.recv().await.map_err(Failure::Channel)? {
                    Some(chunk) => sock_write.write_all(&chunk).await.map_err(Failure::Socket)?,
                    None => {
                        sock_write.shutdown().await.map_err(Failure::Socket)?;
                        return Ok::<_, Failure>(());
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => None,
            result = async { tokio::try_join!(upstream, downstream) } => Some(result),
        }
    };

    match result {
        Some(Ok(_)) => PumpOutcome::Completed,
        Some(Err(Failure::Channel(e))) => {
            abort_socket(&socket);
            PumpOutcome::ChannelFailed(e)
        }
        Some(Err(Failure::Socket(e))) => {
            from_channel.reset();
            PumpOutcome::SocketFailed(e)
        }
        None => {
            from_channel.reset();
            abort_socket(&socket);
            PumpOutcome::Cancelled
        }
    }
}

/// Make the close send RST rather than FIN
pub(crate) fn abort_socket(socket: &TcpStream) {
    let _ = socket.set_linger(Some(Duration::ZERO));
}
