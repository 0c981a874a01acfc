//! Per-connection service registry
//!
//! Maps service descriptors to running instances. Creation is idempotent:
//! a descriptor that already has a live instance returns that instance's id.
//! The registry lives inside its [`Connection`](crate::Connection); nothing
//! here is process-wide.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use weft_core::error::RegistryError;
use weft_core::{
    InstanceId, RemoteServiceStatus, Service, ServiceDescriptor, ServiceFactory, ServiceStatus,
    StatusReporter,
};

struct Entry {
    descriptor: ServiceDescriptor,
    service: Arc<dyn Service>,
    status: StatusReporter,
}

struct RegistryState {
    next_id: u32,
    instances: HashMap<InstanceId, Entry>,
    by_descriptor: HashMap<ServiceDescriptor, InstanceId>,
    shut_down: bool,
}

impl RegistryState {
    /// Next free id; wraps past `u32::MAX` and never yields 0
    fn allocate_id(&mut self) -> InstanceId {
        loop {
            let id = InstanceId::new(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.instances.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Registry of service instances for one connection
pub struct ServiceRegistry {
    factories: HashMap<u32, Arc<dyn ServiceFactory>>,
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    /// Create an empty registry with no factories
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            state: Mutex::new(RegistryState {
                next_id: 1,
                instances: HashMap::new(),
                by_descriptor: HashMap::new(),
                shut_down: false,
            }),
        }
    }

    /// Register a factory for its service kind
    pub fn with_factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.factories.insert(factory.kind().as_u32(), factory);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up or start the instance for `descriptor`
    ///
    /// A fresh instance that fails to start stays registered as `Failed`
    /// until it is stopped; the error carries its id.
    pub async fn create(&self, descriptor: ServiceDescriptor) -> Result<InstanceId, RegistryError> {
        let (id, service, status) = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(RegistryError::ShutDown);
            }
            if let Some(id) = state.by_descriptor.get(&descriptor) {
                debug!("Reusing {} for {}", id, descriptor);
                return Ok(*id);
            }

            let factory = self
                .factories
                .get(&descriptor.kind_id())
                .ok_or(RegistryError::UnknownService(descriptor.kind_id()))?;
            let service = factory
                .create(descriptor.parameters())
                .map_err(RegistryError::InvalidParameters)?;

            let id = state.allocate_id();

            let status = StatusReporter::new();
            status.starting();
            state.instances.insert(
                id,
                Entry {
                    descriptor: descriptor.clone(),
                    service: Arc::clone(&service),
                    status: status.clone(),
                },
            );
            state.by_descriptor.insert(descriptor.clone(), id);
            (id, service, status)
        };

        info!("Starting {} as {}", descriptor, id);
        let result = service.start(status.clone()).await;

        // Settle under the lock so a concurrent stop sees a consistent state
        let registered = {
            let state = self.lock();
            let registered = state.instances.contains_key(&id);
            if registered {
                match &result {
                    Ok(()) => {
                        status.running();
                    }
                    Err(_) => {
                        status.failed();
                    }
                }
            }
            registered
        };

        match result {
            Ok(()) if registered => {
                info!("{} running", id);
                Ok(id)
            }
            Ok(()) => {
                debug!("{} was stopped while starting", id);
                service.stop().await;
                status.stopped();
                Ok(id)
            }
            Err(e) => {
                error!("{} failed to start: {}", id, e);
                service.stop().await;
                if !registered {
                    status.stopped();
                }
                Err(RegistryError::StartFailed { id, source: e })
            }
        }
    }

    /// Stop and remove an instance; absent ids are ignored
    pub async fn stop(&self, id: InstanceId) -> bool {
        let (entry, was_starting) = {
            let mut state = self.lock();
            let Some(entry) = state.instances.remove(&id) else {
                debug!("Stop of unknown {} ignored", id);
                return false;
            };
            if state.by_descriptor.get(&entry.descriptor) == Some(&id) {
                state.by_descriptor.remove(&entry.descriptor);
            }
            let was_starting = entry.status.current() == ServiceStatus::Starting;
            if was_starting {
                entry.status.stopped();
            }
            (entry, was_starting)
        };

        info!("Stopping {} ({})", id, entry.descriptor);
        // A start still in flight finishes the teardown itself
        if !was_starting {
            entry.service.stop().await;
            entry.status.stopped();
        }
        true
    }

    /// Status of the instance registered for `descriptor`
    pub fn status(&self, descriptor: &ServiceDescriptor) -> (RemoteServiceStatus, Option<InstanceId>) {
        let state = self.lock();
        match state.by_descriptor.get(descriptor) {
            Some(id) => {
                let current = state.instances.get(id).map(|e| e.status.current());
                (RemoteServiceStatus::from_status(current), Some(*id))
            }
            None => (RemoteServiceStatus::NotFound, None),
        }
    }

    /// Lifecycle state of an instance
    pub fn status_of(&self, id: InstanceId) -> Option<ServiceStatus> {
        self.lock().instances.get(&id).map(|e| e.status.current())
    }

    /// Id of the instance registered for `descriptor`
    pub fn id_for(&self, descriptor: &ServiceDescriptor) -> Option<InstanceId> {
        self.lock().by_descriptor.get(descriptor).copied()
    }

    /// Watch an instance's status
    pub fn subscribe(&self, id: InstanceId) -> Option<watch::Receiver<ServiceStatus>> {
        self.lock().instances.get(&id).map(|e| e.status.subscribe())
    }

    /// Snapshot of all instances, ordered by id
    pub fn list(&self) -> Vec<(InstanceId, ServiceDescriptor, ServiceStatus)> {
        let state = self.lock();
        let mut instances: Vec<_> = state
            .instances
            .iter()
            .map(|(id, e)| (*id, e.descriptor.clone(), e.status.current()))
            .collect();
        instances.sort_by_key(|(id, _, _)| *id);
        instances
    }

    pub fn len(&self) -> usize {
        self.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail and stop every instance; later creates are refused
    pub async fn shutdown(&self) {
        let entries: Vec<(InstanceId, Entry)> = {
            let mut state = self.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.by_descriptor.clear();
            state.instances.drain().collect()
        };

        if !entries.is_empty() {
            warn!("Tearing down {} service instances", entries.len());
        }
        for (id, entry) in entries {
            let was_starting = entry.status.current() == ServiceStatus::Starting;
            entry.status.failed();
            if !was_starting {
                entry.service.stop().await;
            }
            entry.status.stopped();
            debug!("{} torn down", id);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use weft_core::error::ServiceError;
    use weft_core::{ServiceKind, ServiceParameters};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct FakeService {
        counters: Arc<Counters>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Service for FakeService {
        fn kind(&self) -> ServiceKind {
            ServiceKind::ChannelToSocket
        }

        async fn start(&self, _status: StatusReporter) -> Result<(), ServiceError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ServiceError::MissingParameter("boom".to_string()));
            }
            Ok(())
        }

        async fn stop(&self) {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        gate: Option<Arc<Notify>>,
    }

    impl ServiceFactory for FakeFactory {
        fn kind(&self) -> ServiceKind {
            ServiceKind::ChannelToSocket
        }

        fn create(&self, parameters: &ServiceParameters) -> Result<Arc<dyn Service>, ServiceError> {
            let fail = parameters.get("fail").is_some();
            parameters.require("port")?;
            Ok(Arc::new(FakeService {
                counters: Arc::clone(&self.counters),
                fail,
                gate: self.gate.clone(),
            }))
        }
    }

    fn registry(gate: Option<Arc<Notify>>) -> (Arc<ServiceRegistry>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let registry = ServiceRegistry::new().with_factory(Arc::new(FakeFactory {
            counters: Arc::clone(&counters),
            gate,
        }));
        (Arc::new(registry), counters)
    }

    fn descriptor(port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(
            ServiceKind::ChannelToSocket,
            ServiceParameters::new().with("port", port),
        )
    }

    #[tokio::test]
    async fn test_ids_wrap_past_zero_and_skip_live_ones() {
        let (registry, _) = registry(None);
        let low = registry.create(descriptor(1)).await.unwrap();
        assert_eq!(low.as_u32(), 1);

        registry.lock().next_id = u32::MAX;
        let high = registry.create(descriptor(2)).await.unwrap();
        assert_eq!(high.as_u32(), u32::MAX);

        // 0 is never handed out and 1 is still live
        let wrapped = registry.create(descriptor(3)).await.unwrap();
        assert_eq!(wrapped.as_u32(), 2);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_until_stop() {
        let (registry, counters) = registry(None);

        let first = registry.create(descriptor(80)).await.unwrap();
        for _ in 0..5 {
            assert_eq!(registry.create(descriptor(80)).await.unwrap(), first);
        }
        assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status(&descriptor(80)), (RemoteServiceStatus::Running, Some(first)));

        assert!(registry.stop(first).await);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status(&descriptor(80)), (RemoteServiceStatus::NotFound, None));

        let second = registry.create(descriptor(80)).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_descriptors_get_distinct_ids() {
        let (registry, _) = registry(None);

        let a = registry.create(descriptor(80)).await.unwrap();
        let b = registry.create(descriptor(81)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_for(&descriptor(81)), Some(b));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let (registry, counters) = registry(None);
        assert!(!registry.stop(InstanceId::new(42)).await);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_kind_and_bad_parameters() {
        let (registry, _) = registry(None);

        let unknown = ServiceDescriptor::from_raw(99, ServiceParameters::new());
        assert!(matches!(
            registry.create(unknown).await,
            Err(RegistryError::UnknownService(99))
        ));

        let bad = ServiceDescriptor::new(ServiceKind::ChannelToSocket, ServiceParameters::new());
        assert!(matches!(
            registry.create(bad).await,
            Err(RegistryError::InvalidParameters(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_stays_registered() {
        let (registry, _) = registry(None);
        let failing = ServiceDescriptor::new(
            ServiceKind::ChannelToSocket,
            ServiceParameters::new().with("port", 1).with("fail", true),
        );

        let err = registry.create(failing.clone()).await.unwrap_err();
        let id = err.instance_id().unwrap();
        assert_eq!(registry.status(&failing), (RemoteServiceStatus::Failed, Some(id)));

        // Same descriptor keeps answering with the failed instance
        assert_eq!(registry.create(failing.clone()).await.unwrap(), id);

        registry.stop(id).await;
        assert_eq!(registry.status_of(id), None);
        assert_eq!(registry.status(&failing).0, RemoteServiceStatus::NotFound);
    }

    #[tokio::test]
    async fn test_stop_during_start() {
        let gate = Arc::new(Notify::new());
        let (registry, counters) = registry(Some(Arc::clone(&gate)));

        let creating = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create(descriptor(80)).await })
        };
        while registry.id_for(&descriptor(80)).is_none() {
            tokio::task::yield_now().await;
        }
        let id = registry.id_for(&descriptor(80)).unwrap();
        let mut status = registry.subscribe(id).unwrap();

        registry.stop(id).await;
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);

        gate.notify_one();
        assert_eq!(creating.await.unwrap().unwrap(), id);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*status.borrow_and_update(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, counters) = registry(None);
        let id = registry.create(descriptor(80)).await.unwrap();
        let status = registry.subscribe(id).unwrap();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*status.borrow(), ServiceStatus::Stopped);
        assert!(matches!(
            registry.create(descriptor(80)).await,
            Err(RegistryError::ShutDown)
        ));
    }
}
