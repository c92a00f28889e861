//! Configuration for the scheduler.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::schedule::SchedulerOptions;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the RPC listener binds.
    pub listen_addr: SocketAddr,

    /// Address registered in the service registry.
    pub advertise_addr: String,

    /// Registry base URL; `None` selects the in-process registry.
    pub registry_url: Option<String>,

    /// Bound on one host channel send.
    pub send_timeout: Duration,

    /// Per-host outbound channel capacity.
    pub channel_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = var("CORRAL_SCHEDULER_ADDR")
            .unwrap_or_else(|| "0.0.0.0:1112".to_string())
            .parse()
            .context("CORRAL_SCHEDULER_ADDR must be a socket address")?;

        let advertise_addr =
            var("CORRAL_SCHEDULER_ADVERTISE_ADDR").unwrap_or_else(|| listen_addr.to_string());

        let registry_url = var("CORRAL_REGISTRY_URL").filter(|s| !s.is_empty());

        let send_timeout_ms: u64 = match var("CORRAL_SEND_TIMEOUT_MS") {
            Some(s) => s
                .parse()
                .context("CORRAL_SEND_TIMEOUT_MS must be a number of milliseconds")?,
            None => 2000,
        };

        let channel_capacity: usize = match var("CORRAL_HOST_CHANNEL_CAPACITY") {
            Some(s) => s
                .parse()
                .context("CORRAL_HOST_CHANNEL_CAPACITY must be a positive integer")?,
            None => 1024,
        };
        anyhow::ensure!(
            channel_capacity > 0,
            "CORRAL_HOST_CHANNEL_CAPACITY must be a positive integer"
        );

        Ok(Self {
            listen_addr,
            advertise_addr,
            registry_url,
            send_timeout: Duration::from_millis(send_timeout_ms),
            channel_capacity,
        })
    }

    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            send_timeout: self.send_timeout,
            channel_capacity: self.channel_capacity,
        }
    }
}
