//! Channel handles and per-channel flow-control state

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::Notify;
use weft_core::error::MuxError;
use weft_protocol::{Frame, VirtualPort};

use crate::multiplexer::MuxInner;
use crate::ports::ChannelKey;

/// State shared between a channel's handles and the multiplexer's reader
pub(crate) struct ChannelShared {
    pub key: ChannelKey,
    state: Mutex<ChannelState>,
    readable: Notify,
    writable: Notify,
}

#[derive(Debug)]
pub(crate) struct ChannelState {
    /// Window advertised to the peer
    window: u32,
    recv_queue: VecDeque<Bytes>,
    /// Bytes the peer may still send before receiving more credit
    recv_allowance: u32,
    /// Bytes consumed since the last window update
    consumed: u32,
    /// Bytes we may still send
    send_credit: u32,
    /// Peer sent Fin or Close
    read_eof: bool,
    /// We sent Fin
    write_closed: bool,
    /// We sent Close or Reset
    local_closed: bool,
    /// Peer sent Close or Reset
    remote_closed: bool,
    reset: bool,
    broken: Option<String>,
}

/// What the reader task should do after applying an inbound frame
pub(crate) enum Disposition {
    Keep,
    Remove,
}

impl ChannelShared {
    pub fn new(key: ChannelKey, window: u32, send_credit: u32) -> Self {
        Self {
            key,
            state: Mutex::new(ChannelState {
                window,
                recv_queue: VecDeque::new(),
                recv_allowance: window,
                consumed: 0,
                send_credit,
                read_eof: false,
                write_closed: false,
                local_closed: false,
                remote_closed: false,
                reset: false,
                broken: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // A panic while holding this lock leaves the flags consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wake_all(&self) {
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Queue inbound data, enforcing the advertised window
    pub fn on_data(&self, payload: Bytes) -> Result<(), MuxError> {
        let mut state = self.lock();
        if state.local_closed || state.read_eof {
            return Ok(());
        }

        let len = payload.len();
        if len > state.recv_allowance as usize {
            return Err(MuxError::FlowControlViolation {
                port: self.key.local,
                received: len,
                allowed: state.recv_allowance,
            });
        }

        if len > 0 {
            state.recv_allowance -= len as u32;
            state.recv_queue.push_back(payload);
            drop(state);
            self.readable.notify_one();
        }
        Ok(())
    }

    pub fn on_window_update(&self, increment: u32) {
        let mut state = self.lock();
        state.send_credit = state.send_credit.saturating_add(increment);
        drop(state);
        self.writable.notify_one();
    }

    pub fn on_fin(&self) {
        self.lock().read_eof = true;
        self.readable.notify_one();
    }

    pub fn on_close(&self) -> Disposition {
        let mut state = self.lock();
        state.read_eof = true;
        state.remote_closed = true;
        let local_closed = state.local_closed;
        drop(state);
        self.wake_all();

        if local_closed {
            Disposition::Remove
        } else {
            Disposition::Keep
        }
    }

    pub fn on_reset(&self) {
        let mut state = self.lock();
        state.reset = true;
        state.remote_closed = true;
        state.local_closed = true;
        drop(state);
        self.wake_all();
    }

    /// Fail the channel because the transport is gone
    pub fn on_broken(&self, reason: &str) {
        let mut state = self.lock();
        if state.broken.is_none() {
            state.broken = Some(reason.to_string());
        }
        state.local_closed = true;
        drop(state);
        self.wake_all();
    }
}

/// Owns one end of a channel; dropping the last handle closes it
pub(crate) struct ChannelCore {
    shared: Arc<ChannelShared>,
    mux: Arc<MuxInner>,
    max_frame: usize,
}

impl ChannelCore {
    fn key(&self) -> ChannelKey {
        self.shared.key
    }

    async fn recv(&self) -> Result<Option<Bytes>, MuxError> {
        loop {
            {
                let mut state = self.shared.lock();
                if state.reset {
                    return Err(MuxError::ChannelReset);
                }
                if let Some(reason) = &state.broken {
                    return Err(MuxError::TransportBroken(reason.clone()));
                }
                if let Some(chunk) = state.recv_queue.pop_front() {
                    self.return_credit(&mut state, chunk.len() as u32);
                    return Ok(Some(chunk));
                }
                if state.read_eof {
                    return Ok(None);
                }
            }
            self.shared.readable.notified().await;
        }
    }

    fn return_credit(&self, state: &mut ChannelState, len: u32) {
        state.consumed += len;
        if state.read_eof || state.local_closed || state.consumed < state.window / 2 {
            return;
        }

        let increment = state.consumed;
        state.consumed = 0;
        state.recv_allowance += increment;
        let key = self.key();
        // A failure here means the transport is gone; the next recv reports it
        let _ = self
            .mux
            .send_frame(Frame::window_update(key.local, key.remote, increment));
    }

    async fn send(&self, mut data: Bytes) -> Result<(), MuxError> {
        while !data.is_empty() {
            let chunk = {
                let mut state = self.shared.lock();
                if state.reset {
                    return Err(MuxError::ChannelReset);
                }
                if let Some(reason) = &state.broken {
                    return Err(MuxError::TransportBroken(reason.clone()));
                }
                if state.write_closed || state.local_closed {
                    return Err(MuxError::WriteClosed);
                }
                if state.remote_closed {
                    return Err(MuxError::ChannelClosed);
                }

                if state.send_credit == 0 {
                    None
                } else {
                    let len = data
                        .len()
                        .min(state.send_credit as usize)
                        .min(self.max_frame);
                    state.send_credit -= len as u32;
                    Some(data.split_to(len))
                }
            };

            match chunk {
                Some(chunk) => {
                    let key = self.key();
                    self.mux
                        .send_frame(Frame::data(key.local, key.remote, chunk))?;
                }
                None => self.shared.writable.notified().await,
            }
        }
        Ok(())
    }

    fn close_write(&self) -> Result<(), MuxError> {
        {
            let mut state = self.shared.lock();
            if state.write_closed || state.local_closed {
                return Ok(());
            }
            state.write_closed = true;
        }
        let key = self.key();
        self.mux.send_frame(Frame::fin(key.local, key.remote))
    }

    fn reset(&self) {
        {
            let mut state = self.shared.lock();
            if state.local_closed {
                return;
            }
            state.local_closed = true;
            state.remote_closed = true;
            state.reset = true;
        }
        self.shared.wake_all();

        let key = self.key();
        tracing::debug!("Resetting channel {}", key);
        let _ = self.mux.send_frame(Frame::reset(key.local, key.remote));
        self.mux.remove_channel(&self.shared);
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let remote_closed = {
            let mut state = self.shared.lock();
            if state.local_closed {
                None
            } else {
                state.local_closed = true;
                Some(state.remote_closed)
            }
        };

        match remote_closed {
            Some(remote_closed) => {
                let key = self.key();
                tracing::trace!("Closing channel {}", key);
                let _ = self.mux.send_frame(Frame::close(key.local, key.remote));
                if remote_closed {
                    self.mux.remove_channel(&self.shared);
                }
            }
            // Reset, or failed with the transport
            None => self.mux.remove_channel(&self.shared),
        }
    }
}

/// A bidirectional, ordered, flow-controlled byte stream
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, mux: Arc<MuxInner>) -> Self {
        let max_frame = mux.config().max_frame_payload as usize;
        Self {
            core: Arc::new(ChannelCore {
                shared,
                mux,
                max_frame,
            }),
        }
    }

    /// This side's virtual port
    pub fn local_port(&self) -> VirtualPort {
        self.core.key().local
    }

    /// The peer's virtual port
    pub fn remote_port(&self) -> VirtualPort {
        self.core.key().remote
    }

    /// Send bytes, waiting for credit as needed
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), MuxError> {
        self.core.send(data.into()).await
    }

    /// Receive the next chunk; `None` once the peer has finished writing
    pub async fn recv(&mut self) -> Result<Option<Bytes>, MuxError> {
        self.core.recv().await
    }

    /// Half-close: the peer reads EOF after the data already sent
    pub fn close_write(&self) -> Result<(), MuxError> {
        self.core.close_write()
    }

    /// Abort the channel; the peer's reads and writes fail with `ChannelReset`
    pub fn reset(self) {
        self.core.reset();
    }

    /// Close both directions
    pub fn close(self) {
        drop(self);
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (
            ChannelReader {
                core: Arc::clone(&self.core),
            },
            ChannelWriter { core: self.core },
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("key", &self.core.key()).finish()
    }
}

/// Read half of a [`Channel`]
pub struct ChannelReader {
    core: Arc<ChannelCore>,
}

impl ChannelReader {
    pub fn local_port(&self) -> VirtualPort {
        self.core.key().local
    }

    /// Receive the next chunk; `None` once the peer has finished writing
    pub async fn recv(&mut self) -> Result<Option<Bytes>, MuxError> {
        self.core.recv().await
    }

    /// Abort the whole channel
    pub fn reset(&self) {
        self.core.reset();
    }
}

/// Write half of a [`Channel`]
pub struct ChannelWriter {
    core: Arc<ChannelCore>,
}

impl ChannelWriter {
    pub fn local_port(&self) -> VirtualPort {
        self.core.key().local
    }

    /// Send bytes, waiting for credit as needed
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), MuxError> {
        self.core.send(data.into()).await
    }

    /// Half-close the channel
    pub fn close_write(&self) -> Result<(), MuxError> {
        self.core.close_write()
    }

    /// Abort the whole channel
    pub fn reset(&self) {
        self.core.reset();
    }
}
