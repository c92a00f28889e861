//! Tells the scheduler about finished jobs.
//!
//! Every terminal event becomes a `RemoveJobs` call so the scheduler returns
//! the job's resources. Calls are batched and retried until they succeed;
//! removing an id twice is harmless on the scheduler side.

use corral_events::{Event, EventKind};
use corral_id::{HostId, JobId};
use corral_scheduler::SchedulerClient;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::stopped;
use crate::error::SchedulerLinkError;
use crate::registration::{BackoffPolicy, SchedulerLocator};
use crate::state::JobTable;

pub struct Reconciler {
    host_id: HostId,
    locator: SchedulerLocator,
    events: mpsc::UnboundedReceiver<Event>,
    backoff: BackoffPolicy,
    client: Option<SchedulerClient>,
}

fn is_terminal(event: &Event) -> bool {
    matches!(event.kind, EventKind::Stop | EventKind::Error)
}

impl Reconciler {
    /// Subscribes to `table` immediately.
    pub fn new(table: &JobTable, locator: SchedulerLocator) -> Self {
        Self {
            host_id: table.host_id().clone(),
            locator,
            events: table.subscribe(None),
            backoff: BackoffPolicy::default(),
            client: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut pending: Vec<JobId> = Vec::new();
        let mut attempt = 0u32;

        loop {
            if pending.is_empty() {
                let event = tokio::select! {
                    event = self.events.recv() => event,
                    _ = stopped(&mut shutdown) => return,
                };
                match event {
                    Some(event) if is_terminal(&event) => pending.push(event.job_id),
                    Some(_) => continue,
                    None => return,
                }
            }
            while let Ok(event) = self.events.try_recv() {
                if is_terminal(&event) {
                    pending.push(event.job_id);
                }
            }

            match self.remove(pending.clone()).await {
                Ok(()) => {
                    debug!(count = pending.len(), "Finished jobs removed from scheduler");
                    pending.clear();
                    attempt = 0;
                }
                Err(e) => {
                    self.client = None;
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(error = %e, pending = pending.len(), delay_ms = delay.as_millis() as u64, "RemoveJobs failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut shutdown) => {
                            info!(pending = pending.len(), "Shutting down with unreported job exits");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn remove(&mut self, job_ids: Vec<JobId>) -> Result<(), SchedulerLinkError> {
        let client = match self.client.take() {
            Some(client) => client,
            None => self.locator.connect().await?,
        };
        let client = self.client.insert(client);
        client.remove_jobs(self.host_id.clone(), job_ids).await?;
        Ok(())
    }
}
