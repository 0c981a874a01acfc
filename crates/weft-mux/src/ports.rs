//! Channel addressing and ephemeral port allocation

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;

use rand::Rng;
use weft_protocol::VirtualPort;

/// Virtual ports handed out to channels opened without an explicit source
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Identifies a channel from one side: (our port, the peer's port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub local: VirtualPort,
    pub remote: VirtualPort,
}

impl ChannelKey {
    pub fn new(local: VirtualPort, remote: VirtualPort) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local.as_u16(), self.remote.as_u16())
    }
}

/// Tracks source ports of channels this side opened
#[derive(Debug)]
pub(crate) struct PortAllocator {
    in_use: HashMap<VirtualPort, usize>,
    cursor: u16,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            in_use: HashMap::new(),
            cursor: rand::thread_rng().gen_range(EPHEMERAL_PORTS),
        }
    }

    /// Whether an opened channel uses `port` as its source
    pub fn is_used(&self, port: VirtualPort) -> bool {
        self.in_use.contains_key(&port)
    }

    /// Pick the next free ephemeral port, skipping ports `reserved` rejects
    pub fn allocate(&mut self, reserved: impl Fn(VirtualPort) -> bool) -> Option<VirtualPort> {
        let span = (*EPHEMERAL_PORTS.end() - *EPHEMERAL_PORTS.start()) as usize + 1;

        for _ in 0..span {
            let port = VirtualPort::new(self.cursor);
            self.cursor = if self.cursor == *EPHEMERAL_PORTS.end() {
                *EPHEMERAL_PORTS.start()
            } else {
                self.cursor + 1
            };

            if !self.is_used(port) && !reserved(port) {
                self.acquire(port);
                return Some(port);
            }
        }

        None
    }

    pub fn acquire(&mut self, port: VirtualPort) {
        *self.in_use.entry(port).or_insert(0) += 1;
    }

    pub fn release(&mut self, port: VirtualPort) {
        if let Some(count) = self.in_use.get_mut(&port) {
            *count -= 1;
            if *count == 0 {
                self.in_use.remove(&port);
            }
        }
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}
