//! Outbound job channels of registered hosts.
//!
//! Kept apart from the cluster state so a [`Host`](corral_proto::Host) value
//! never owns its channel. Each binding carries a generation so a stale
//! connection cannot unbind the registration that replaced it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use corral_id::HostId;
use corral_proto::Job;
use tokio::sync::mpsc;

/// Why a job could not be queued for a host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("host {0} has no open registration stream")]
    NotConnected(HostId),

    #[error("host {0} did not accept the job in time")]
    Stalled(HostId),
}

/// A slot in a host channel reserved ahead of commit.
pub type Permit = mpsc::OwnedPermit<Job>;

#[derive(Default)]
pub struct HostChannels {
    bindings: Mutex<HashMap<HostId, (u64, mpsc::Sender<Job>)>>,
    generations: AtomicU64,
}

impl HostChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `sender` to `host_id`; `None` if the host already has a binding.
    pub fn try_bind(&self, host_id: &HostId, sender: mpsc::Sender<Job>) -> Option<u64> {
        let mut bindings = self.lock();
        if bindings.contains_key(host_id) {
            return None;
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        bindings.insert(host_id.clone(), (generation, sender));
        Some(generation)
    }

    /// Removes the binding if it still belongs to `generation`.
    pub fn unbind(&self, host_id: &HostId, generation: u64) -> bool {
        let mut bindings = self.lock();
        match bindings.get(host_id) {
            Some((current, _)) if *current == generation => {
                bindings.remove(host_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_bound(&self, host_id: &HostId) -> bool {
        self.lock().contains_key(host_id)
    }

    fn sender(&self, host_id: &HostId) -> Result<mpsc::Sender<Job>, SendError> {
        self.lock()
            .get(host_id)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| SendError::NotConnected(host_id.clone()))
    }

    /// Reserves one slot, waiting at most `timeout` for the host to drain.
    pub async fn reserve(&self, host_id: &HostId, timeout: Duration) -> Result<Permit, SendError> {
        let sender = self.sender(host_id)?;
        match tokio::time::timeout(timeout, sender.reserve_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SendError::NotConnected(host_id.clone())),
            Err(_) => Err(SendError::Stalled(host_id.clone())),
        }
    }

    /// Queues `job`, waiting at most `timeout`.
    pub async fn send(&self, host_id: &HostId, job: Job, timeout: Duration) -> Result<(), SendError> {
        let permit = self.reserve(host_id, timeout).await?;
        permit.send(job);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HostId, (u64, mpsc::Sender<Job>)>> {
        // Critical sections are single map operations.
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
