//! Service traits

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::ServiceError;
use crate::types::{ServiceKind, ServiceParameters, ServiceStatus};

/// A service instance the registry can run
#[async_trait]
pub trait Service: Send + Sync {
    /// Kind of this service
    fn kind(&self) -> ServiceKind;

    /// Bind resources and spawn the service's tasks.
    ///
    /// Returns once the service is serving. Later failures are reported
    /// through `status`.
    async fn start(&self, status: StatusReporter) -> Result<(), ServiceError>;

    /// Cancel the service's tasks and release its resources
    async fn stop(&self);
}

/// Builds services of one kind from their parameters
pub trait ServiceFactory: Send + Sync {
    /// Kind this factory builds
    fn kind(&self) -> ServiceKind;

    /// Validate parameters and build an unstarted service
    fn create(&self, parameters: &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError>;
}

/// Handle a service uses to publish its lifecycle status
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<ServiceStatus>>,
}

impl StatusReporter {
    /// Create a reporter in the `Unstarted` state
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServiceStatus::Unstarted);
        Self { tx: Arc::new(tx) }
    }

    /// Current status
    pub fn current(&self) -> ServiceStatus {
        *self.tx.borrow()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.tx.subscribe()
    }

    /// `Unstarted -> Starting`
    pub fn starting(&self) -> bool {
        self.transition(|s| matches!(s, ServiceStatus::Unstarted), ServiceStatus::Starting)
    }

    /// `Starting -> Running`
    pub fn running(&self) -> bool {
        self.transition(|s| matches!(s, ServiceStatus::Starting), ServiceStatus::Running)
    }

    /// `Starting | Running -> Failed`
    pub fn failed(&self) -> bool {
        self.transition(
            |s| matches!(s, ServiceStatus::Starting | ServiceStatus::Running),
            ServiceStatus::Failed,
        )
    }

    /// Any non-terminal state `-> Stopped`
    pub fn stopped(&self) -> bool {
        self.transition(|s| !matches!(s, ServiceStatus::Stopped), ServiceStatus::Stopped)
    }

    fn transition(&self, allowed: impl Fn(ServiceStatus) -> bool, next: ServiceStatus) -> bool {
        self.tx.send_if_modified(|status| {
            if allowed(*status) {
                *status = next;
                true
            } else {
                false
            }
        })
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let reporter = StatusReporter::new();
        assert_eq!(reporter.current(), ServiceStatus::Unstarted);

        assert!(!reporter.running());
        assert!(reporter.starting());
        assert!(reporter.running());
        assert!(reporter.failed());
        assert!(!reporter.running());
        assert!(reporter.stopped());
        assert!(!reporter.failed());
        assert_eq!(reporter.current(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes() {
        let reporter = StatusReporter::new();
        let mut rx = reporter.subscribe();

        reporter.starting();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ServiceStatus::Starting);
    }
}
