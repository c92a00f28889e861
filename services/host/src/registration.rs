//! Registration stream client.
//!
//! Keeps one `RegisterHost` stream open to the scheduler. Each connection
//! advertises the host and every job that is still active, so a restarted
//! scheduler rebuilds its view of this host from the advertisement. Jobs
//! arriving on the stream go to the [`Runner`]. Running jobs are unaffected
//! by the stream going away.

use std::sync::Arc;
use std::time::Duration;

use corral_proto::Host;
use corral_registry::Registry;
use corral_scheduler::SchedulerClient;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::stopped;
use crate::error::SchedulerLinkError;
use crate::runner::Runner;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(31) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        let spread = delay * self.jitter;
        let jitter = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Registered and receiving jobs.
    Connected,
    /// Waiting before the next attempt.
    BackoffWait,
}

/// Where the scheduler is found.
#[derive(Clone)]
pub enum SchedulerLocator {
    Static(String),
    /// The current leader of `corral-scheduler`.
    Registry(Arc<dyn Registry>),
}

impl SchedulerLocator {
    pub async fn resolve(&self) -> Result<String, SchedulerLinkError> {
        match self {
            SchedulerLocator::Static(addr) => Ok(addr.clone()),
            SchedulerLocator::Registry(registry) => registry
                .leader(corral_scheduler::SERVICE_NAME)
                .await?
                .map(|leader| leader.addr)
                .ok_or(SchedulerLinkError::NoLeader),
        }
    }

    pub async fn connect(&self) -> Result<SchedulerClient, SchedulerLinkError> {
        let addr = self.resolve().await?;
        Ok(SchedulerClient::connect(addr.as_str()).await?)
    }
}

pub struct RegistrationClient {
    template: Host,
    runner: Arc<Runner>,
    locator: SchedulerLocator,
    backoff: BackoffPolicy,
    state: watch::Sender<ConnectionState>,
}

impl RegistrationClient {
    /// `template` carries the host's resources, attributes, rules and port
    /// range; its job list is filled in on every connect.
    pub fn new(template: Host, runner: Arc<Runner>, locator: SchedulerLocator) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            template,
            runner,
            locator,
            backoff: BackoffPolicy::default(),
            state,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The host as advertised right now.
    pub fn advertisement(&self) -> Host {
        let mut host = self.template.clone();
        host.advertised.clear();
        host.jobs = self.runner.table().active_jobs();
        host
    }

    /// Connects, streams jobs and reconnects until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let outcome = tokio::select! {
                outcome = self.session(&mut attempt) => outcome,
                _ = stopped(&mut shutdown) => break,
            };
            match outcome {
                Ok(()) => info!(host_id = %self.template.id, "Scheduler closed the registration stream"),
                Err(e) => warn!(host_id = %self.template.id, error = %e, "Registration stream failed"),
            }

            self.state.send_replace(ConnectionState::BackoffWait);
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting to scheduler");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn session(&self, attempt: &mut u32) -> Result<(), SchedulerLinkError> {
        let client = self.locator.connect().await?;
        let advert = self.advertisement();
        let jobs = advert.jobs.len();
        let mut stream = client.register_host(advert).await?;

        *attempt = 0;
        self.state.send_replace(ConnectionState::Connected);
        info!(host_id = %stream.host_id(), jobs, "Registered with scheduler");

        while let Some(job) = stream.next_job().await? {
            debug!(job_id = %job.id, "Job received");
            if let Err(e) = self.runner.accept(job) {
                warn!(error = %e, "Job could not be accepted");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        Ok(())
    }
}
