//! Host port pool.

use std::collections::BTreeSet;
use std::sync::Mutex;

use corral_proto::PortRange;
use tracing::warn;

use crate::error::PortError;

/// Allocator for the externally reachable ports of one host.
#[derive(Debug)]
pub struct PortPool {
    range: PortRange,
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            free: Mutex::new((range.low..=range.high).collect()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn size(&self) -> u32 {
        self.range.size()
    }

    pub fn available(&self) -> u32 {
        self.lock().len() as u32
    }

    /// Takes `count` free ports, lowest first.
    pub fn allocate(&self, count: u32) -> Result<Vec<u16>, PortError> {
        if count > self.size() {
            return Err(PortError::PoolTooSmall {
                requested: count,
                pool_size: self.size(),
            });
        }

        let mut free = self.lock();
        if count as usize > free.len() {
            return Err(PortError::Exhausted {
                requested: count,
                available: free.len() as u32,
            });
        }
        let ports: Vec<u16> = free.iter().take(count as usize).copied().collect();
        for port in &ports {
            free.remove(port);
        }
        Ok(ports)
    }

    /// Returns ports to the pool.
    pub fn release(&self, ports: &[u16]) {
        let mut free = self.lock();
        for &port in ports {
            if !self.range.contains(port) {
                warn!(port, "Released port outside the pool range");
                continue;
            }
            if !free.insert(port) {
                warn!(port, "Released port that was not allocated");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        self.free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
