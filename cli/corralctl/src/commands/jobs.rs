//! Job listing and control.

use anyhow::Result;
use clap::Args;
use corral_id::JobId;
use corral_proto::{ClusterSnapshot, Job};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_output, print_single, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct JobArgs {
    /// Job ID.
    job: String,
}

impl JobArgs {
    pub fn job_id(&self) -> Result<JobId> {
        Ok(JobId::parse(&self.job)?)
    }
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "JOB")]
    id: String,

    #[tabled(rename = "HOST")]
    host: String,

    #[tabled(rename = "COMMAND")]
    command: String,

    #[tabled(rename = "PORTS")]
    ports: u32,

    #[tabled(rename = "SERVICE", display = "display_option")]
    service: Option<String>,
}

impl JobRow {
    fn new(host: &str, job: &Job) -> Self {
        let command = if job.command.is_empty() {
            job.container_image.clone()
        } else {
            job.command.join(" ")
        };
        Self {
            id: job.id.to_string(),
            host: host.to_string(),
            command,
            ports: job.tcp_ports,
            service: job.service_name().map(str::to_string),
        }
    }
}

fn rows(state: &ClusterSnapshot) -> Vec<JobRow> {
    state
        .hosts
        .values()
        .flat_map(|host| {
            host.jobs
                .iter()
                .map(move |job| JobRow::new(host.id.as_str(), job))
        })
        .collect()
}

pub async fn ps(ctx: CommandContext) -> Result<()> {
    let state = ctx
        .endpoints
        .scheduler()
        .await?
        .state()
        .await
        .map_err(CliError::from)?;
    print_output(&rows(&state), ctx.format);
    Ok(())
}

pub async fn inspect(ctx: CommandContext, args: JobArgs) -> Result<()> {
    let job_id = args.job_id()?;
    let (_, host) = ctx.endpoints.host_of(&job_id).await?;
    let job = host.get_job(&job_id).await.map_err(CliError::from)?;
    print_single(&job);
    Ok(())
}

pub async fn stop(ctx: CommandContext, args: JobArgs) -> Result<()> {
    let job_id = args.job_id()?;
    let (host_id, host) = ctx.endpoints.host_of(&job_id).await?;
    let job = host.stop_job(&job_id).await.map_err(CliError::from)?;
    if job.is_terminal() {
        print_success(&format!("job {job_id} on {host_id} already finished ({})", job.status));
    } else {
        print_success(&format!("stopping job {job_id} on {host_id}"));
    }
    Ok(())
}
