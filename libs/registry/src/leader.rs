//! Background tracking of a service leader.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{Instance, WatchKind};
use crate::{Registry, RegistryError};

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// What is currently known about a service's leadership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    /// The registry answered the last watch.
    pub available: bool,
    pub leader: Option<Instance>,
}

/// Follows the leader of one service and whether the registry is reachable.
pub struct LeaderTracker {
    state: watch::Receiver<LeaderState>,
    task: JoinHandle<()>,
}

impl LeaderTracker {
    pub fn spawn(
        registry: Arc<dyn Registry>,
        service: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, state) = watch::channel(LeaderState::default());
        let task = tokio::spawn(track(registry, service.into(), tx, shutdown));
        Self { state, task }
    }

    pub fn state(&self) -> LeaderState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    pub fn is_available(&self) -> bool {
        self.state.borrow().available
    }

    pub fn is_leader(&self, instance_id: &str) -> bool {
        let state = self.state.borrow();
        state.available && state.leader.as_ref().is_some_and(|l| l.id == instance_id)
    }

    /// Waits until the tracker has seen the registry answer.
    pub async fn ready(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| s.available).await;
    }
}

impl Drop for LeaderTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(RETRY_MAX);
    let jitter = rand::rng().random_range(0.8..1.2);
    capped.mul_f64(jitter)
}

async fn track(
    registry: Arc<dyn Registry>,
    service: String,
    tx: watch::Sender<LeaderState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match follow(&*registry, &service, &tx, &mut shutdown, &mut attempt).await {
            Ok(()) => return,
            Err(e) => {
                tx.send_modify(|s| s.available = false);
                let delay = retry_delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(service = %service, error = %e, delay_ms = delay.as_millis() as u64, "Registry watch lost, retrying");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Follows one watch until it fails. `Ok` means shutdown was requested.
async fn follow(
    registry: &dyn Registry,
    service: &str,
    tx: &watch::Sender<LeaderState>,
    shutdown: &mut watch::Receiver<bool>,
    attempt: &mut u32,
) -> Result<(), RegistryError> {
    let mut events = registry.watch(service).await?;

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            event = events.next() => event,
        };

        match event {
            Some(Ok(event)) => match event.kind {
                WatchKind::Current => {
                    let leader = registry.leader(service).await?;
                    *attempt = 0;
                    info!(service, leader = ?leader.as_ref().map(|l| &l.addr), "Registry watch established");
                    tx.send_replace(LeaderState {
                        available: true,
                        leader,
                    });
                }
                WatchKind::Leader => {
                    debug!(service, leader = ?event.instance.as_ref().map(|l| &l.addr), "Leader changed");
                    tx.send_modify(|s| s.leader = event.instance);
                }
                WatchKind::Down => {
                    let gone = event.instance.map(|i| i.id);
                    tx.send_modify(|s| {
                        if s.leader.as_ref().map(|l| &l.id) == gone.as_ref() {
                            s.leader = None;
                        }
                    });
                }
                WatchKind::Up | WatchKind::Update | WatchKind::ServiceMeta => {}
            },
            Some(Err(RegistryError::Lagged(n))) => {
                debug!(service, missed = n, "Leader watch lagged, refreshing");
                let leader = registry.leader(service).await?;
                tx.send_modify(|s| s.leader = leader);
            }
            Some(Err(e)) => return Err(e),
            None => return Err(RegistryError::Unavailable("watch ended".to_string())),
        }
    }
}
