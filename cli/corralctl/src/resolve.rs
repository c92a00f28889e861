//! Finding the scheduler and host agents.

use corral_host::HostClient;
use corral_id::{HostId, JobId};
use corral_registry::{HttpRegistry, Registry};
use corral_scheduler::SchedulerClient;

use crate::error::CliError;

/// Scheduler address used when neither a flag nor the registry names one.
pub const DEFAULT_SCHEDULER: &str = "127.0.0.1:1112";

#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub scheduler: Option<String>,
    pub registry_url: Option<String>,
    pub host_url: Option<String>,
}

impl Endpoints {
    fn registry(&self) -> Result<Option<HttpRegistry>, CliError> {
        match &self.registry_url {
            Some(url) => Ok(Some(HttpRegistry::new(url.as_str())?)),
            None => Ok(None),
        }
    }

    /// Flag first, then the registry leader, then the local default.
    pub async fn scheduler_addr(&self) -> Result<String, CliError> {
        if let Some(addr) = &self.scheduler {
            return Ok(addr.clone());
        }
        if let Some(registry) = self.registry()? {
            if let Some(leader) = registry.leader(corral_scheduler::SERVICE_NAME).await? {
                return Ok(leader.addr);
            }
        }
        Ok(DEFAULT_SCHEDULER.to_string())
    }

    pub async fn scheduler(&self) -> Result<SchedulerClient, CliError> {
        let addr = self.scheduler_addr().await?;
        Ok(SchedulerClient::connect(addr.as_str()).await?)
    }

    /// Client for the host agent registered with `host_id`.
    pub async fn host(&self, host_id: &HostId) -> Result<HostClient, CliError> {
        if let Some(url) = &self.host_url {
            return Ok(HostClient::new(url.as_str())?);
        }
        let registry = self
            .registry()?
            .ok_or_else(|| CliError::HostUnreachable(host_id.to_string()))?;
        let instance = registry
            .instances(corral_host::SERVICE_NAME)
            .await?
            .into_iter()
            .find(|i| i.meta.get("host_id").map(String::as_str) == Some(host_id.as_str()))
            .ok_or_else(|| CliError::HostUnreachable(host_id.to_string()))?;
        Ok(HostClient::new(http_url(&instance.addr))?)
    }

    /// The host a job is placed on, according to the scheduler.
    pub async fn host_of(&self, job_id: &JobId) -> Result<(HostId, HostClient), CliError> {
        let state = self.scheduler().await?.state().await?;
        let host_id = state
            .hosts
            .values()
            .find(|h| h.job(job_id).is_some())
            .map(|h| h.id.clone())
            .ok_or_else(|| CliError::JobNotPlaced(job_id.to_string()))?;
        let client = self.host(&host_id).await?;
        Ok((host_id, client))
    }
}

fn http_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
