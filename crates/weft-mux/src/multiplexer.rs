//! The multiplexer: one transport, many channels
//!
//! Two tasks own the transport. The writer drains a single FIFO of outbound
//! frames, so frames from all channels share the wire in send order. The
//! reader decodes frames and dispatches them to channels, pending opens and
//! listeners. Any I/O error, protocol error or EOF tears the whole
//! multiplexer down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use weft_core::config::MuxConfig;
use weft_core::error::MuxError;
use weft_protocol::{Frame, FrameCodec, FrameKind, VirtualPort};

use crate::channel::{Channel, ChannelShared, Disposition};
use crate::listener::Listener;
use crate::ports::{ChannelKey, PortAllocator};

type OpenResult = Result<u32, MuxError>;

/// Routing table for one multiplexer
struct Table {
    channels: HashMap<ChannelKey, Arc<ChannelShared>>,
    pending: HashMap<ChannelKey, oneshot::Sender<OpenResult>>,
    listeners: HashMap<VirtualPort, mpsc::Sender<Channel>>,
    /// Source ports of channels we opened
    ports: PortAllocator,
    /// Keys whose source port is held in `ports`
    opened: HashSet<ChannelKey>,
}

impl Table {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            pending: HashMap::new(),
            listeners: HashMap::new(),
            ports: PortAllocator::new(),
            opened: HashSet::new(),
        }
    }

    fn remove(&mut self, key: &ChannelKey) {
        self.channels.remove(key);
        self.pending.remove(key);
        if self.opened.remove(key) {
            self.ports.release(key.local);
        }
    }
}

pub(crate) struct MuxInner {
    config: MuxConfig,
    outbound: mpsc::UnboundedSender<Frame>,
    table: Mutex<Table>,
    cancel: CancellationToken,
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl MuxInner {
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn broken(&self) -> MuxError {
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        MuxError::TransportBroken(reason)
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), MuxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.broken());
        }
        self.outbound.send(frame).map_err(|_| self.broken())
    }

    /// Drop a channel's routing entry if it still belongs to `shared`
    pub fn remove_channel(&self, shared: &Arc<ChannelShared>) {
        let mut table = self.table();
        let current = table
            .channels
            .get(&shared.key)
            .map(|c| Arc::ptr_eq(c, shared))
            .unwrap_or(false);
        if current {
            table.remove(&shared.key);
            trace!("Channel {} released", shared.key);
        }
    }

    pub fn unregister_listener(&self, port: VirtualPort) {
        self.table().listeners.remove(&port);
        debug!("Stopped listening on {}", port);
    }

    /// Tear everything down; the first reason wins
    fn shutdown(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.clone());
        self.cancel.cancel();

        let (channels, pending, listeners) = {
            let mut table = self.table();
            table.ports.clear();
            table.opened.clear();
            (
                std::mem::take(&mut table.channels),
                std::mem::take(&mut table.pending),
                std::mem::take(&mut table.listeners),
            )
        };

        for shared in channels.values() {
            shared.on_broken(&reason);
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(MuxError::TransportBroken(reason.clone())));
        }
        drop(listeners);

        info!(
            "Multiplexer closed ({}), {} channels failed",
            reason,
            channels.len()
        );
    }

    /// Apply one inbound frame. An error is fatal for the connection.
    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        let key = ChannelKey::new(frame.dst, frame.src);
        trace!(
            "recv {} {} ({} bytes)",
            frame.kind.name(),
            key,
            frame.payload.len()
        );

        match frame.kind {
            FrameKind::Open => {
                let window = frame.window()?;
                self.accept_inbound(key, window)
            }
            FrameKind::OpenAck => {
                let window = frame.window()?;
                let (shared, tx) = {
                    let mut table = self.table();
                    (table.channels.get(&key).cloned(), table.pending.remove(&key))
                };
                match (shared, tx) {
                    (Some(shared), Some(tx)) => {
                        shared.on_window_update(window);
                        if tx.send(Ok(window)).is_err() {
                            // Opener gave up before the ack arrived
                            self.send_frame(Frame::reset(key.local, key.remote))?;
                            self.table().remove(&key);
                        }
                    }
                    _ => warn!("Unexpected open-ack for {}", key),
                }
                Ok(())
            }
            FrameKind::Refuse => {
                let tx = {
                    let mut table = self.table();
                    let tx = table.pending.remove(&key);
                    if tx.is_some() {
                        table.remove(&key);
                    }
                    tx
                };
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Err(MuxError::RemoteRefused(key.remote)));
                    }
                    None => warn!("Unexpected refuse for {}", key),
                }
                Ok(())
            }
            FrameKind::Data => match self.lookup(&key) {
                Some(shared) => shared.on_data(frame.payload),
                None => {
                    trace!("Dropping data for unknown channel {}", key);
                    Ok(())
                }
            },
            FrameKind::WindowUpdate => {
                let increment = frame.window()?;
                if let Some(shared) = self.lookup(&key) {
                    shared.on_window_update(increment);
                }
                Ok(())
            }
            FrameKind::Fin => {
                if let Some(shared) = self.lookup(&key) {
                    shared.on_fin();
                }
                Ok(())
            }
            FrameKind::Close => {
                if let Some(shared) = self.lookup(&key) {
                    if let Disposition::Remove = shared.on_close() {
                        self.remove_channel(&shared);
                    }
                }
                Ok(())
            }
            FrameKind::Reset => {
                if let Some(shared) = self.lookup(&key) {
                    debug!("Channel {} reset by peer", key);
                    shared.on_reset();
                    self.remove_channel(&shared);
                }
                Ok(())
            }
        }
    }

    fn lookup(&self, key: &ChannelKey) -> Option<Arc<ChannelShared>> {
        self.table().channels.get(key).cloned()
    }

    fn accept_inbound(self: &Arc<Self>, key: ChannelKey, window: u32) -> Result<(), MuxError> {
        let delivered = {
            let mut table = self.table();
            if table.channels.contains_key(&key) || table.pending.contains_key(&key) {
                debug!("Refusing open {}: pair in use", key);
                None
            } else {
                let listener = table.listeners.get(&key.local).cloned();
                match listener.map(|tx| tx.try_reserve_owned()) {
                    Some(Ok(permit)) => {
                        let shared =
                            Arc::new(ChannelShared::new(key, self.config.window_size, window));
                        table.channels.insert(key, Arc::clone(&shared));
                        Some((permit, shared))
                    }
                    Some(Err(_)) => {
                        debug!("Refusing open {}: accept backlog full", key);
                        None
                    }
                    None => {
                        debug!("Refusing open {}: nothing listening", key);
                        None
                    }
                }
            }
        };

        match delivered {
            Some((permit, shared)) => {
                self.send_frame(Frame::open_ack(
                    key.local,
                    key.remote,
                    self.config.window_size,
                ))?;
                permit.send(Channel::new(shared, Arc::clone(self)));
                debug!("Accepted channel {}", key);
                Ok(())
            }
            None => self.send_frame(Frame::refuse(key.local, key.remote)),
        }
    }
}

/// Handle to a running multiplexer
///
/// Cloning yields another handle to the same multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Start multiplexing over `transport`
    pub fn new<T>(transport: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MuxInner {
            config,
            outbound: outbound_tx,
            table: Mutex::new(Table::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        });

        let (reader, writer) = tokio::io::split(transport);
        tokio::spawn(write_loop(Arc::clone(&inner), outbound_rx, writer));
        tokio::spawn(read_loop(Arc::clone(&inner), reader));

        Self { inner }
    }

    /// Open a channel to the peer's `port` from an ephemeral local port
    pub async fn open(&self, port: VirtualPort) -> Result<Channel, MuxError> {
        let (key, rx, shared) = {
            let mut guard = self.inner.table();
            if self.is_closed() {
                return Err(self.inner.broken());
            }
            let table = &mut *guard;
            let listeners = &table.listeners;
            let local = table
                .ports
                .allocate(|p| listeners.contains_key(&p))
                .ok_or(MuxError::PortsExhausted)?;
            let key = ChannelKey::new(local, port);
            table.opened.insert(key);
            let (rx, shared) = self.register_pending(table, key);
            (key, rx, shared)
        };

        self.complete_open(key, rx, shared).await
    }

    /// Open a channel to the peer's `port` from an explicit local port
    pub async fn open_from(
        &self,
        local: VirtualPort,
        port: VirtualPort,
    ) -> Result<Channel, MuxError> {
        let key = ChannelKey::new(local, port);
        let (rx, shared) = {
            let mut table = self.inner.table();
            if self.is_closed() {
                return Err(self.inner.broken());
            }
            if table.listeners.contains_key(&local)
                || table.ports.is_used(local)
                || table.channels.contains_key(&key)
            {
                return Err(MuxError::PortUnavailable(local));
            }
            table.ports.acquire(local);
            table.opened.insert(key);
            self.register_pending(&mut table, key)
        };

        self.complete_open(key, rx, shared).await
    }

    fn register_pending(
        &self,
        table: &mut Table,
        key: ChannelKey,
    ) -> (oneshot::Receiver<OpenResult>, Arc<ChannelShared>) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(ChannelShared::new(key, self.inner.config.window_size, 0));
        table.channels.insert(key, Arc::clone(&shared));
        table.pending.insert(key, tx);
        (rx, shared)
    }

    async fn complete_open(
        &self,
        key: ChannelKey,
        rx: oneshot::Receiver<OpenResult>,
        shared: Arc<ChannelShared>,
    ) -> Result<Channel, MuxError> {
        debug!("Opening channel {}", key);
        if let Err(e) = self.inner.send_frame(Frame::open(
            key.local,
            key.remote,
            self.inner.config.window_size,
        )) {
            self.inner.table().remove(&key);
            return Err(e);
        }

        let result = tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(self.inner.broken()),
            result = rx => result.unwrap_or_else(|_| Err(self.inner.broken())),
        };

        match result {
            Ok(_) => Ok(Channel::new(shared, Arc::clone(&self.inner))),
            Err(e) => {
                debug!("Open {} failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Accept channels the peer opens at `port`
    pub fn listen(&self, port: VirtualPort) -> Result<Listener, MuxError> {
        let mut table = self.inner.table();
        if self.is_closed() {
            return Err(self.inner.broken());
        }
        if table.listeners.contains_key(&port) || table.ports.is_used(port) {
            return Err(MuxError::PortUnavailable(port));
        }

        let (tx, rx) = mpsc::channel(self.inner.config.accept_backlog.max(1));
        table.listeners.insert(port, tx);
        debug!("Listening on {}", port);

        Ok(Listener::new(port, rx, Arc::clone(&self.inner)))
    }

    /// Close the transport and fail every channel
    pub fn close(&self) {
        self.inner.shutdown("closed locally");
    }

    /// Wait until the multiplexer has shut down
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Why the multiplexer shut down, once it has
    pub fn close_reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of channels with a routing entry
    pub fn channel_count(&self) -> usize {
        self.inner.table().channels.len()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<W>(
    inner: Arc<MuxInner>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    writer: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = frames.feed(frame).await {
            inner.shutdown(format!("write failed: {}", e));
            return;
        }
        while let Ok(frame) = outbound.try_recv() {
            if let Err(e) = frames.feed(frame).await {
                inner.shutdown(format!("write failed: {}", e));
                return;
            }
        }
        if let Err(e) = frames.flush().await {
            inner.shutdown(format!("write failed: {}", e));
            return;
        }
    }

    let _ = frames.close().await;
    trace!("Writer task finished");
}

async fn read_loop<R>(inner: Arc<MuxInner>, reader: R)
where
    R: AsyncRead + Unpin,
{
    // No legitimate data frame exceeds the window we advertise
    let max_payload = (inner.config.window_size as usize).max(4);
    let mut frames = FramedRead::new(reader, FrameCodec::with_max_payload(max_payload));

    loop {
        let next = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if let Err(e) = inner.dispatch(frame) {
                    warn!("Protocol violation: {}", e);
                    inner.shutdown(e.to_string());
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Transport read failed: {}", e);
                inner.shutdown(e.to_string());
                break;
            }
            None => {
                inner.shutdown("transport closed by peer");
                break;
            }
        }
    }

    trace!("Reader task finished");
}
