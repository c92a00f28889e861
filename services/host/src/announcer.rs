//! Registers running jobs in the service registry.
//!
//! A job whose metadata names a service and that holds at least one port is
//! announced at `<external_ip>:<first port>` once it runs. The registration
//! is closed when the job finishes.

use std::collections::HashMap;
use std::sync::Arc;

use corral_events::{Event, EventKind};
use corral_id::JobId;
use corral_registry::{Heartbeater, Instance, Registry, ServiceConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::state::JobTable;

pub struct Announcer {
    table: Arc<JobTable>,
    registry: Arc<dyn Registry>,
    external_ip: String,
    events: mpsc::UnboundedReceiver<Event>,
    live: HashMap<JobId, Heartbeater>,
}

impl Announcer {
    /// Subscribes to `table` immediately.
    pub fn new(table: Arc<JobTable>, registry: Arc<dyn Registry>, external_ip: String) -> Self {
        let events = table.subscribe(None);
        Self {
            table,
            registry,
            external_ip,
            events,
            live: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            let Some(event) = event else {
                break;
            };
            match event.kind {
                EventKind::Start => self.announce(&event.job_id).await,
                EventKind::Stop | EventKind::Error => self.withdraw(&event.job_id).await,
                EventKind::Create => {}
            }
        }

        for (job_id, heartbeater) in self.live.drain() {
            if let Err(e) = heartbeater.close().await {
                warn!(job_id = %job_id, error = %e, "Failed to withdraw service instance");
            }
        }
    }

    async fn announce(&mut self, job_id: &JobId) {
        let Some(active) = self.table.get(job_id) else {
            return;
        };
        if active.is_terminal() {
            return;
        }
        let (Some(service), Some(port)) =
            (active.job.service_name(), active.allocated_ports.first())
        else {
            return;
        };

        let addr = format!("{}:{port}", self.external_ip);
        let instance = Instance::new(addr.clone())
            .with_meta("job_id", job_id.as_str())
            .with_meta("host_id", active.host_id.as_str());
        let result = async {
            self.registry
                .add_service(service, ServiceConfig::default())
                .await?;
            self.registry.register_instance(service, instance).await
        }
        .await;

        match result {
            Ok(heartbeater) => {
                info!(job_id = %job_id, service, addr = %addr, "Service instance registered");
                self.live.insert(job_id.clone(), heartbeater);
            }
            Err(e) => warn!(job_id = %job_id, service, error = %e, "Service registration failed"),
        }
    }

    async fn withdraw(&mut self, job_id: &JobId) {
        let Some(heartbeater) = self.live.remove(job_id) else {
            return;
        };
        match heartbeater.close().await {
            Ok(()) => debug!(job_id = %job_id, "Service instance withdrawn"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to withdraw service instance"),
        }
    }
}
