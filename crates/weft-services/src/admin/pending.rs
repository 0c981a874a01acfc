//! Pending control requests tracker
//!
//! Routes responses arriving on the control channel back to the task that
//! issued the matching request.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Raw response fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u32,
    pub instance_id: u32,
}

/// Tracks control requests awaiting responses
#[derive(Clone, Default)]
pub struct PendingRequests {
    /// Maps correlation id -> (control channel generation, response sender)
    requests: Arc<DashMap<u32, (u64, oneshot::Sender<ControlResponse>)>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request sent on control channel `generation`
    /// Returns a receiver that will receive the response
    pub fn register(
        &self,
        correlation_id: u32,
        generation: u64,
    ) -> oneshot::Receiver<ControlResponse> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(correlation_id, (generation, tx));
        rx
    }

    /// Deliver a response
    /// Returns true if the response was delivered, false if the request wasn't found
    pub fn respond(&self, correlation_id: u32, response: ControlResponse) -> bool {
        match self.requests.remove(&correlation_id) {
            Some((_, (_, tx))) => tx.send(response).is_ok(),
            None => {
                warn!("No pending request for correlation id {}", correlation_id);
                false
            }
        }
    }

    /// Forget a request (timeout or send failure)
    pub fn cancel(&self, correlation_id: u32) {
        self.requests.remove(&correlation_id);
    }

    /// Drop the requests sent on control channel `generation`; their
    /// callers see the outcome as indeterminate
    pub fn fail_channel(&self, generation: u64) {
        let before = self.requests.len();
        self.requests.retain(|_, (sent_on, _)| *sent_on != generation);
        let count = before.saturating_sub(self.requests.len());
        if count > 0 {
            debug!("Abandoned {} pending control requests", count);
        }
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}
