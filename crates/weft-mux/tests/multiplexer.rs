//! Multiplexer integration tests over in-memory transports

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use weft_mux::{Channel, MuxConfig, MuxError, Multiplexer, VirtualPort};
use weft_protocol::{Frame, FrameCodec, FrameKind};

fn pair_with(config: MuxConfig) -> (Multiplexer, Multiplexer) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Multiplexer::new(a, config.clone()),
        Multiplexer::new(b, config),
    )
}

fn pair() -> (Multiplexer, Multiplexer) {
    pair_with(MuxConfig::default())
}

async fn read_all(channel: &mut Channel) -> Result<Vec<u8>, MuxError> {
    let mut out = Vec::new();
    while let Some(chunk) = channel.recv().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

#[tokio::test]
async fn test_open_accept_echo() {
    let (client, server) = pair();
    let mut listener = server.listen(VirtualPort::new(80)).unwrap();

    let echo = tokio::spawn(async move {
        let mut channel = listener.accept().await.unwrap();
        assert_eq!(channel.local_port(), VirtualPort::new(80));
        let data = read_all(&mut channel).await.unwrap();
        channel.send(data).await.unwrap();
        channel.close_write().unwrap();
    });

    let mut channel = client.open(VirtualPort::new(80)).await.unwrap();
    assert_eq!(channel.remote_port(), VirtualPort::new(80));
    assert!(weft_mux::EPHEMERAL_PORTS.contains(&channel.local_port().as_u16()));

    channel.send(Bytes::from_static(b"hello")).await.unwrap();
    channel.close_write().unwrap();

    assert_eq!(read_all(&mut channel).await.unwrap(), b"hello");
    echo.await.unwrap();
}

#[tokio::test]
async fn test_interleaved_channels_preserve_order() {
    const CHANNELS: usize = 8;

    let config = MuxConfig {
        window_size: 8 * 1024,
        max_frame_payload: 1024,
        accept_backlog: CHANNELS,
    };
    let (client, server) = pair_with(config);
    let mut listener = server.listen(VirtualPort::new(9000)).unwrap();

    let receiver = tokio::spawn(async move {
        let mut readers = Vec::new();
        for _ in 0..CHANNELS {
            let mut channel = listener.accept().await.unwrap();
            readers.push(tokio::spawn(async move {
                let port = channel.remote_port();
                (port, read_all(&mut channel).await.unwrap())
            }));
        }
        let mut received = Vec::new();
        for reader in readers {
            received.push(reader.await.unwrap());
        }
        received
    });

    let mut senders = Vec::new();
    for i in 0..CHANNELS {
        let channel = client.open(VirtualPort::new(9000)).await.unwrap();
        senders.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(i as u64);
            let mut sent = Vec::new();
            for _ in 0..rng.gen_range(20..60) {
                let len = rng.gen_range(1..3000);
                let chunk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                sent.extend_from_slice(&chunk);
                channel.send(chunk).await.unwrap();
                if rng.gen_bool(0.3) {
                    tokio::task::yield_now().await;
                }
            }
            channel.close_write().unwrap();
            (channel.local_port(), sent, channel)
        }));
    }

    let mut sent = Vec::new();
    for sender in senders {
        sent.push(sender.await.unwrap());
    }
    let received = receiver.await.unwrap();

    assert_eq!(received.len(), CHANNELS);
    for (port, bytes) in received {
        let (_, expected, _) = sent
            .iter()
            .find(|(local, _, _)| *local == port)
            .expect("channel was opened by the client");
        assert_eq!(&bytes, expected, "stream from {}", port);
    }
}

#[tokio::test]
async fn test_slow_consumer_does_not_stall_others() {
    let config = MuxConfig {
        window_size: 4096,
        max_frame_payload: 1024,
        accept_backlog: 4,
    };
    let (client, server) = pair_with(config);
    let mut listener = server.listen(VirtualPort::new(1)).unwrap();

    let stalled = client.open(VirtualPort::new(1)).await.unwrap();
    let _stalled_peer = listener.accept().await.unwrap();

    // More than one window: this send parks once credit runs out
    let blocked = tokio::spawn(async move {
        stalled.send(vec![0u8; 16 * 1024]).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let active = client.open(VirtualPort::new(1)).await.unwrap();
    let mut active_peer = listener.accept().await.unwrap();

    let payload = vec![7u8; 64 * 1024];
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        active.send(payload).await.unwrap();
        active.close_write().unwrap();
        active
    });

    let received = tokio::time::timeout(Duration::from_secs(5), read_all(&mut active_peer))
        .await
        .expect("active channel made progress")
        .unwrap();
    assert_eq!(received, expected);
    writer.await.unwrap();
    blocked.abort();
}

#[tokio::test]
async fn test_open_without_listener_is_refused() {
    let (client, _server) = pair();

    let result = client.open(VirtualPort::new(4444)).await;
    assert_eq!(result.unwrap_err(), MuxError::RemoteRefused(VirtualPort::new(4444)));
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn test_port_conflicts() {
    let (client, server) = pair();
    let _listener = server.listen(VirtualPort::new(22)).unwrap();

    assert_eq!(
        server.listen(VirtualPort::new(22)).unwrap_err(),
        MuxError::PortUnavailable(VirtualPort::new(22))
    );

    let _first = client
        .open_from(VirtualPort::new(5000), VirtualPort::new(22))
        .await
        .unwrap();
    assert_eq!(
        client
            .open_from(VirtualPort::new(5000), VirtualPort::new(22))
            .await
            .unwrap_err(),
        MuxError::PortUnavailable(VirtualPort::new(5000))
    );
    assert_eq!(
        client.listen(VirtualPort::new(5000)).unwrap_err(),
        MuxError::PortUnavailable(VirtualPort::new(5000))
    );
}

#[tokio::test]
async fn test_listener_drop_allows_relisten() {
    let (_client, server) = pair();

    let listener = server.listen(VirtualPort::new(8080)).unwrap();
    drop(listener);
    assert!(server.listen(VirtualPort::new(8080)).is_ok());
}

#[tokio::test]
async fn test_half_close_keeps_reverse_direction_open() {
    let (client, server) = pair();
    let mut listener = server.listen(VirtualPort::new(7)).unwrap();

    let mut channel = client.open(VirtualPort::new(7)).await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    channel.send(Bytes::from_static(b"request")).await.unwrap();
    channel.close_write().unwrap();
    assert_eq!(
        channel.send(Bytes::from_static(b"late")).await.unwrap_err(),
        MuxError::WriteClosed
    );

    assert_eq!(read_all(&mut peer).await.unwrap(), b"request");
    peer.send(Bytes::from_static(b"response")).await.unwrap();
    drop(peer);

    assert_eq!(read_all(&mut channel).await.unwrap(), b"response");
    assert_eq!(
        channel.send(Bytes::from_static(b"x")).await.unwrap_err(),
        MuxError::WriteClosed
    );
}

#[tokio::test]
async fn test_close_fails_peer_writes() {
    let (client, server) = pair();
    let mut listener = server.listen(VirtualPort::new(7)).unwrap();

    let channel = client.open(VirtualPort::new(7)).await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    channel.close();
    assert_eq!(peer.recv().await.unwrap(), None);
    assert_eq!(
        peer.send(Bytes::from_static(b"x")).await.unwrap_err(),
        MuxError::ChannelClosed
    );

    drop(peer);
    tokio::time::timeout(Duration::from_secs(1), async {
        while client.channel_count() + server.channel_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both sides released the channel");
}

#[tokio::test]
async fn test_reset_reaches_peer() {
    let (client, server) = pair();
    let mut listener = server.listen(VirtualPort::new(7)).unwrap();

    let channel = client.open(VirtualPort::new(7)).await.unwrap();
    let mut peer = listener.accept().await.unwrap();

    channel.reset();
    assert_eq!(peer.recv().await.unwrap_err(), MuxError::ChannelReset);
    assert_eq!(
        peer.send(Bytes::from_static(b"x")).await.unwrap_err(),
        MuxError::ChannelReset
    );
}

#[tokio::test]
async fn test_transport_loss_fails_everything() {
    let (client, server) = pair();
    let mut listener = server.listen(VirtualPort::new(7)).unwrap();

    let mut channel = client.open(VirtualPort::new(7)).await.unwrap();
    let _peer = listener.accept().await.unwrap();

    server.close();

    assert!(matches!(
        channel.recv().await,
        Err(MuxError::TransportBroken(_))
    ));
    client.closed().await;
    assert!(client.is_closed());
    assert!(matches!(
        client.open(VirtualPort::new(7)).await,
        Err(MuxError::TransportBroken(_))
    ));
    assert!(matches!(
        listener.accept().await,
        Err(MuxError::TransportBroken(_))
    ));
}

#[tokio::test]
async fn test_torn_frame_is_fatal() {
    let (transport, mut raw) = tokio::io::duplex(4096);
    let mux = Multiplexer::new(transport, MuxConfig::default());
    let mut listener = mux.listen(VirtualPort::new(80)).unwrap();

    // Header announces 100 bytes, only 10 follow before EOF
    let mut buf = BytesMut::new();
    buf.put_u16(50000);
    buf.put_u16(80);
    buf.put_u8(FrameKind::Data.as_u8());
    buf.put_u8(0);
    buf.put_u16(100);
    buf.extend_from_slice(&[0u8; 10]);
    raw.write_all(&buf).await.unwrap();
    raw.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), mux.closed())
        .await
        .expect("torn frame tears the multiplexer down");
    assert!(mux.close_reason().unwrap().contains("Torn frame"));
    assert!(matches!(
        listener.accept().await,
        Err(MuxError::TransportBroken(_))
    ));
}

#[tokio::test]
async fn test_flow_control_violation_is_fatal() {
    let config = MuxConfig {
        window_size: 1024,
        max_frame_payload: 512,
        accept_backlog: 4,
    };
    let (transport, raw) = tokio::io::duplex(64 * 1024);
    let mux = Multiplexer::new(transport, config);
    let mut listener = mux.listen(VirtualPort::new(80)).unwrap();
    let mut peer = Framed::new(raw, FrameCodec::new());

    let (src, dst) = (VirtualPort::new(50000), VirtualPort::new(80));
    peer.send(Frame::open(src, dst, 1024)).await.unwrap();

    let ack = peer.next().await.unwrap().unwrap();
    assert_eq!(ack.kind, FrameKind::OpenAck);
    assert_eq!(ack.window().unwrap(), 1024);
    let mut channel = listener.accept().await.unwrap();

    peer.send(Frame::data(src, dst, Bytes::from(vec![1u8; 512])))
        .await
        .unwrap();
    peer.send(Frame::data(src, dst, Bytes::from(vec![2u8; 600])))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), mux.closed())
        .await
        .expect("violation tears the multiplexer down");
    assert!(mux.close_reason().unwrap().contains("Flow control"));
    assert!(matches!(
        channel.recv().await,
        Err(MuxError::TransportBroken(_))
    ));
}

#[tokio::test]
async fn test_window_updates_return_credit() {
    let config = MuxConfig {
        window_size: 1024,
        max_frame_payload: 256,
        accept_backlog: 4,
    };
    let (transport, raw) = tokio::io::duplex(64 * 1024);
    let mux = Multiplexer::new(transport, config);
    let mut listener = mux.listen(VirtualPort::new(80)).unwrap();
    let mut peer = Framed::new(raw, FrameCodec::new());

    let (src, dst) = (VirtualPort::new(50000), VirtualPort::new(80));
    peer.send(Frame::open(src, dst, 1024)).await.unwrap();
    assert_eq!(peer.next().await.unwrap().unwrap().kind, FrameKind::OpenAck);
    let mut channel = listener.accept().await.unwrap();

    for _ in 0..2 {
        peer.send(Frame::data(src, dst, Bytes::from(vec![0u8; 256])))
            .await
            .unwrap();
    }
    for _ in 0..2 {
        assert_eq!(channel.recv().await.unwrap().unwrap().len(), 256);
    }

    let update = peer.next().await.unwrap().unwrap();
    assert_eq!(update.kind, FrameKind::WindowUpdate);
    assert_eq!((update.src, update.dst), (dst, src));
    assert_eq!(update.window().unwrap(), 512);
}
