//! In-process registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::heartbeat::{Heartbeater, Lease};
use crate::types::{Instance, LeaderType, ServiceConfig, ServiceEvent, ServiceMeta, WatchKind};
use crate::{EventStream, Registry, RegistryError};

const EVENT_BUFFER: usize = 256;

struct Service {
    config: ServiceConfig,
    /// Registration order.
    instances: Vec<Instance>,
    leader: Option<String>,
    meta: Option<ServiceMeta>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Service {
    fn new(config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            config,
            instances: Vec::new(),
            leader: None,
            meta: None,
            events,
        }
    }

    fn leader_instance(&self) -> Option<&Instance> {
        let id = self.leader.as_ref()?;
        self.instances.iter().find(|i| &i.id == id)
    }

    /// Re-elects under the oldest-instance policy, announcing a change.
    fn elect(&mut self, name: &str) {
        if self.config.leader_type != LeaderType::Oldest {
            return;
        }
        let oldest = self.instances.iter().min_by_key(|i| i.index).cloned();
        let new_id = oldest.as_ref().map(|i| i.id.clone());
        if new_id != self.leader {
            self.leader = new_id;
            if let Some(inst) = oldest {
                let _ = self
                    .events
                    .send(ServiceEvent::instance(name, WatchKind::Leader, inst));
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    services: HashMap<String, Service>,
    next_index: u64,
}

/// Registry kept entirely in memory.
///
/// Cloning yields a handle to the same registry.
#[derive(Clone)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
    available: Arc<AtomicBool>,
    outage: watch::Sender<bool>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (outage, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            available: Arc::new(AtomicBool::new(true)),
            outage,
        }
    }

    /// Simulates the registry becoming unreachable or coming back.
    ///
    /// While unavailable every operation fails and open watches end with an
    /// error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.outage.send_replace(!available);
    }

    /// Assigns the leader of a service using [`LeaderType::Manual`].
    pub fn set_leader(&self, service: &str, instance_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        let mut inner = self.lock();
        let svc = inner
            .services
            .get_mut(service)
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
        let inst = svc
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
            .ok_or_else(|| RegistryError::Status {
                status: 404,
                body: format!("instance {instance_id} not found"),
            })?;
        svc.leader = Some(inst.id.clone());
        let _ = svc
            .events
            .send(ServiceEvent::instance(service, WatchKind::Leader, inst));
        Ok(())
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable("registry offline".to_string()))
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deregister(&self, service: &str, instance_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        let mut inner = self.lock();
        let Some(svc) = inner.services.get_mut(service) else {
            return Ok(());
        };
        if let Some(pos) = svc.instances.iter().position(|i| i.id == instance_id) {
            let removed = svc.instances.remove(pos);
            debug!(service, instance_id, "Instance down");
            let _ = svc
                .events
                .send(ServiceEvent::instance(service, WatchKind::Down, removed));
            if svc.leader.as_deref() == Some(instance_id) {
                svc.leader = None;
            }
            svc.elect(service);
        }
        Ok(())
    }
}

struct MemoryLease {
    registry: MemoryRegistry,
    service: String,
    instance_id: String,
}

#[async_trait]
impl Lease for MemoryLease {
    async fn refresh(&self) -> Result<(), RegistryError> {
        self.registry.check()
    }

    async fn release(&self) -> Result<(), RegistryError> {
        self.registry.deregister(&self.service, &self.instance_id)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn add_service(&self, service: &str, config: ServiceConfig) -> Result<(), RegistryError> {
        self.check()?;
        self.lock()
            .services
            .entry(service.to_string())
            .or_insert_with(|| Service::new(config));
        Ok(())
    }

    async fn register_instance(
        &self,
        service: &str,
        mut instance: Instance,
    ) -> Result<Heartbeater, RegistryError> {
        self.check()?;
        {
            let mut inner = self.lock();
            inner.next_index += 1;
            let index = inner.next_index;
            let svc = inner
                .services
                .get_mut(service)
                .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;

            match svc.instances.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => {
                    instance.index = existing.index;
                    *existing = instance.clone();
                    let _ = svc.events.send(ServiceEvent::instance(
                        service,
                        WatchKind::Update,
                        instance.clone(),
                    ));
                }
                None => {
                    instance.index = index;
                    svc.instances.push(instance.clone());
                    debug!(service, instance_id = %instance.id, addr = %instance.addr, "Instance up");
                    let _ = svc.events.send(ServiceEvent::instance(
                        service,
                        WatchKind::Up,
                        instance.clone(),
                    ));
                }
            }
            svc.elect(service);
        }

        let lease = Arc::new(MemoryLease {
            registry: self.clone(),
            service: service.to_string(),
            instance_id: instance.id.clone(),
        });
        Ok(Heartbeater::start(service, instance, lease, None))
    }

    async fn instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        self.check()?;
        let inner = self.lock();
        let svc = inner
            .services
            .get(service)
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
        Ok(svc.instances.clone())
    }

    async fn leader(&self, service: &str) -> Result<Option<Instance>, RegistryError> {
        self.check()?;
        let inner = self.lock();
        Ok(inner
            .services
            .get(service)
            .and_then(|svc| svc.leader_instance().cloned()))
    }

    async fn watch(&self, service: &str) -> Result<EventStream, RegistryError> {
        self.check()?;
        let (initial, rx) = {
            let inner = self.lock();
            let svc = inner
                .services
                .get(service)
                .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
            // Subscribe under the lock so no event falls between snapshot and live.
            let rx = svc.events.subscribe();
            let mut initial: Vec<_> = svc
                .instances
                .iter()
                .map(|i| Ok(ServiceEvent::instance(service, WatchKind::Up, i.clone())))
                .collect();
            if let Some(leader) = svc.leader_instance() {
                initial.push(Ok(ServiceEvent::instance(
                    service,
                    WatchKind::Leader,
                    leader.clone(),
                )));
            }
            initial.push(Ok(ServiceEvent::current(service)));
            (initial, rx)
        };

        let mut outage = self.outage.subscribe();
        let offline = async move {
            let _ = outage.wait_for(|down| *down).await;
        };

        let live = BroadcastStream::new(rx).map(|item| match item {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(RegistryError::Lagged(n)),
        });

        let stream = stream::iter(initial)
            .chain(live)
            .take_until(offline)
            .chain(stream::once(async {
                Err(RegistryError::Unavailable("watch closed".to_string()))
            }));
        Ok(stream.boxed())
    }

    async fn get_meta(&self, service: &str) -> Result<Option<ServiceMeta>, RegistryError> {
        self.check()?;
        let inner = self.lock();
        let svc = inner
            .services
            .get(service)
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;
        Ok(svc.meta.clone())
    }

    async fn set_meta(&self, service: &str, meta: ServiceMeta) -> Result<ServiceMeta, RegistryError> {
        self.check()?;
        let mut inner = self.lock();
        inner.next_index += 1;
        let index = inner.next_index;
        let svc = inner
            .services
            .get_mut(service)
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))?;

        let current = svc.meta.as_ref().map_or(0, |m| m.index);
        if meta.index != current {
            return Err(RegistryError::IndexConflict {
                expected: meta.index,
                current,
            });
        }
        let stored = ServiceMeta {
            data: meta.data,
            index,
        };
        svc.meta = Some(stored.clone());
        let _ = svc.events.send(ServiceEvent {
            service: service.to_string(),
            kind: WatchKind::ServiceMeta,
            instance: None,
            service_meta: Some(stored.clone()),
        });
        Ok(stored)
    }

    async fn ping(&self) -> Result<(), RegistryError> {
        self.check()
    }
}
