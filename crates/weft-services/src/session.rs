//! Drives a set of user services over one connection

use std::fmt;

use tracing::{debug, error, info, warn};
use weft_core::error::ControlError;
use weft_core::{RemoteServiceStatus, WeftError};

use crate::connection::Connection;
use crate::user::{UserService, UserServiceFactory, LOCAL_FORWARD, REMOTE_FORWARD};

/// Outcome of starting one user service
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub name: String,
    /// Last status the peer reported; `None` if it never answered
    pub status: Option<RemoteServiceStatus>,
    pub local_started: bool,
    pub error: Option<String>,
}

impl ServiceReport {
    /// Both halves are up
    pub fn is_healthy(&self) -> bool {
        self.local_started && self.status == Some(RemoteServiceStatus::Running)
    }
}

impl fmt::Display for ServiceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            Some(RemoteServiceStatus::NotFound) => "not found",
            Some(RemoteServiceStatus::Starting) => "starting",
            Some(RemoteServiceStatus::Running) => "running",
            Some(RemoteServiceStatus::Failed) => "failed",
            None => "unknown",
        };
        write!(f, "{}: remote {}", self.name, status)?;
        if !self.local_started {
            write!(f, ", local not started")?;
        }
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}

/// The user services requested for one connection
#[derive(Default)]
pub struct ForwardingSession {
    services: Vec<Box<dyn UserService>>,
}

impl ForwardingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every `-R` and `-L` value up front
    ///
    /// Fails on the first malformed value before anything is created.
    pub fn from_specs(
        factory: &UserServiceFactory,
        remote_forwards: &[String],
        local_forwards: &[String],
    ) -> Result<Self, WeftError> {
        let mut session = Self::new();
        for value in remote_forwards {
            session.add(factory.create(REMOTE_FORWARD.parse_name, value)?);
        }
        for value in local_forwards {
            session.add(factory.create(LOCAL_FORWARD.parse_name, value)?);
        }
        Ok(session)
    }

    pub fn add(&mut self, service: Box<dyn UserService>) {
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Create the remote halves, start the local halves, then poll the
    /// peer until each remote half settles or the poll attempts run out
    pub async fn start(&mut self, connection: &Connection) -> Vec<ServiceReport> {
        let mut reports = Vec::with_capacity(self.services.len());
        for service in &mut self.services {
            reports.push(start_one(service.as_mut(), connection).await);
        }
        reports
    }

    /// Stop the local halves and ask the peer to stop the remote ones
    pub async fn stop(&mut self, connection: &Connection) {
        for service in &mut self.services {
            service.stop_local_services(connection).await;

            for request in service.remote_stop_requests() {
                let id = request.instance_id();
                match connection.client().stop_service(request).await {
                    Ok(()) => debug!("Stopped remote {}", id),
                    Err(e) => warn!("Stop of remote {} for {}: {}", id, service.name(), e),
                }
            }
        }
    }
}

async fn start_one(service: &mut dyn UserService, connection: &Connection) -> ServiceReport {
    let name = service.name();
    let mut report = ServiceReport {
        name: name.clone(),
        status: None,
        local_started: false,
        error: None,
    };
    info!("Starting {}", name);

    for request in service.remote_create_requests() {
        match connection.client().create_service(&request).await {
            Ok(id) => debug!("Peer created {} for {}", id, name),
            Err(ControlError::Indeterminate) => {
                // The create may have happened; the status poll below finds out
                warn!("Create for {} indeterminate, re-querying", name);
            }
            Err(e) => {
                error!("Create for {} failed: {}", name, e);
                report.error = Some(e.to_string());
            }
        }
    }

    match service.start_local_services(connection).await {
        Ok(()) => report.local_started = true,
        Err(e) => {
            report.error.get_or_insert_with(|| e.to_string());
        }
    }

    let control = &connection.config().control;
    for attempt in 0..control.status_poll_attempts {
        if attempt > 0 {
            tokio::time::sleep(control.status_poll_interval).await;
        }
        match service.check_remote_status(connection).await {
            Ok(status) => {
                report.status = Some(status);
                if status.is_settled() {
                    break;
                }
            }
            Err(ControlError::Indeterminate) => {
                debug!("Status query for {} indeterminate", name);
                if connection.is_closed() {
                    break;
                }
            }
            Err(e) => {
                report.error.get_or_insert_with(|| e.to_string());
                break;
            }
        }
    }

    match report.status {
        Some(RemoteServiceStatus::Running) => info!("{} running", name),
        Some(status) => warn!("{} remote status {:?}", name, status),
        None => warn!("{} remote status unknown", name),
    }
    report
}
