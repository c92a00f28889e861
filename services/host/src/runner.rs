//! Drives jobs through the executor.
//!
//! Jobs received from the scheduler are recorded in the [`JobTable`] and
//! launched on their own task: prepare, allocate ports, create, start. The
//! exit watcher maps container events back to jobs. Executor calls are made
//! outside the table lock.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_id::JobId;
use corral_proto::{ActiveJob, Job};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::stopped;
use crate::error::{ExecutorError, StateError};
use crate::executor::{ContainerEvent, ContainerStatus, Executor};
use crate::ports::PortPool;
use crate::state::{JobTable, StopAction};

pub struct Runner {
    table: Arc<JobTable>,
    executor: Arc<dyn Executor>,
    ports: Arc<PortPool>,
    grace: Duration,
    events: Mutex<Option<mpsc::UnboundedReceiver<ContainerEvent>>>,
}

impl Runner {
    /// Subscribes to container events right away so no exit is missed before
    /// [`Runner::watch_exits`] runs.
    pub fn new(
        table: Arc<JobTable>,
        executor: Arc<dyn Executor>,
        ports: Arc<PortPool>,
        grace: Duration,
    ) -> Self {
        let events = executor.subscribe();
        Self {
            table,
            executor,
            ports,
            grace,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn table(&self) -> &Arc<JobTable> {
        &self.table
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }

    /// Records a job and launches it in the background.
    pub fn accept(self: &Arc<Self>, job: Job) -> Result<(), StateError> {
        let active = self.table.add_job(job)?;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.launch(active).await });
        Ok(())
    }

    async fn launch(&self, active: ActiveJob) {
        let job_id = active.job.id.clone();
        let mut allocated = Vec::new();

        let setup: Result<String, ExecutorError> = async {
            self.executor.prepare(&active.job).await?;
            allocated = self.ports.allocate(active.job.tcp_ports)?;
            self.record(self.table.set_ports(&job_id, allocated.clone()))?;
            let container_id = self.executor.create(&active.job, &allocated).await?;
            self.record(self.table.set_container_id(&job_id, &container_id))?;
            self.executor.start(&container_id).await?;
            Ok(container_id)
        }
        .await;

        let container_id = match setup {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job setup failed");
                match self.table.set_failed(&job_id, &e.to_string()) {
                    Ok(Some(failed)) => self.finish(&failed),
                    _ => self.ports.release(&allocated),
                }
                return;
            }
        };

        let Ok(started) = self.table.set_running(&job_id) else {
            return;
        };
        if let Some(done) = started.finished {
            self.finish(&done);
        } else if started.stop_requested {
            info!(job_id = %job_id, "Applying stop requested while starting");
            if let Err(e) = self.executor.stop(&container_id, self.grace).await {
                warn!(job_id = %job_id, error = %e, "Deferred stop failed");
            }
        }
    }

    /// Table updates during setup only fail if the job vanished.
    fn record(&self, result: Result<(), StateError>) -> Result<(), ExecutorError> {
        result.map_err(|e| ExecutorError::Create(e.to_string()))
    }

    /// Returns a terminal job's ports. The container stays until the job is
    /// pruned so its output can still be replayed.
    fn finish(&self, job: &ActiveJob) {
        self.ports.release(&job.allocated_ports);
        debug!(job_id = %job.job.id, ports = job.allocated_ports.len(), "Job resources released");
    }

    /// Drops terminal jobs past `retention` and their containers.
    pub async fn prune(&self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let pruned = self.table.prune_terminal(now, retention);
        for job in &pruned {
            if let Some(cid) = &job.container_id {
                if let Err(e) = self.executor.remove(cid).await {
                    debug!(job_id = %job.job.id, error = %e, "Container removal failed");
                }
            }
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "Pruned finished jobs");
        }
        pruned.len()
    }

    /// Prunes on a fixed period until shutdown.
    pub async fn run_pruner(
        &self,
        period: Duration,
        retention: chrono::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune(Utc::now(), retention).await;
                }
                _ = stopped(&mut shutdown) => return,
            }
        }
    }

    /// Maps container exits to job transitions until shutdown.
    pub async fn watch_exits(&self, mut shutdown: watch::Receiver<bool>) {
        let taken = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut events) = taken else {
            warn!("Exit watcher already running");
            return;
        };

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = stopped(&mut shutdown) => return,
            };
            let Some(event) = event else {
                warn!("Executor event stream closed");
                return;
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: ContainerEvent) {
        let ContainerStatus::Die { exit_code, signal } = event.status else {
            return;
        };
        let Some(job_id) = self.table.job_for_container(&event.container_id) else {
            debug!(container_id = %event.container_id, "Exit for unknown container");
            return;
        };
        match self.table.set_exited(&job_id, exit_code, signal) {
            Ok(Some(done)) => self.finish(&done),
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Exit could not be recorded"),
        }
    }

    /// Initiates a graceful stop. Stopping a finished job is a no-op.
    pub async fn stop(&self, job_id: &JobId) -> Result<StopAction, StateError> {
        let action = self.table.request_stop(job_id)?;
        if let StopAction::Signal { container_id } = &action {
            info!(job_id = %job_id, container_id = %container_id, "Stopping job");
            if let Err(e) = self.executor.stop(container_id, self.grace).await {
                warn!(job_id = %job_id, error = %e, "Stop failed");
            }
        }
        Ok(action)
    }

    /// Stops every active job, then waits up to `grace` plus a margin for the
    /// exits to be recorded.
    pub async fn stop_all(&self) {
        let active: Vec<JobId> = self
            .table
            .list()
            .into_iter()
            .filter(|j| !j.is_terminal())
            .map(|j| j.job.id)
            .collect();
        if active.is_empty() {
            return;
        }
        info!(count = active.len(), "Stopping active jobs");
        for id in &active {
            let _ = self.stop(id).await;
        }

        let deadline = tokio::time::Instant::now() + self.grace + Duration::from_secs(1);
        while tokio::time::Instant::now() < deadline {
            let remaining = active
                .iter()
                .filter(|id| self.table.get(id).is_some_and(|j| !j.is_terminal()))
                .count();
            if remaining == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("Jobs still running after shutdown grace");
    }
}
