//! Cluster state and placement.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use corral_proto::{ClusterSnapshot, Host, HostJobs, ScheduleRequest};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_output, print_single, print_success, print_warning, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// JSON file: `{"<host id>": [<job>, ...], ...}`.
    file: PathBuf,

    /// Place what fits instead of all or nothing.
    #[arg(long)]
    pub incremental: bool,
}

#[derive(Debug, Serialize, Tabled)]
struct HostRow {
    #[tabled(rename = "HOST")]
    id: String,

    #[tabled(rename = "JOBS")]
    jobs: usize,

    #[tabled(rename = "RESOURCES")]
    resources: String,

    #[tabled(rename = "PORTS", display = "display_option")]
    ports: Option<String>,

    #[tabled(rename = "ATTRIBUTES")]
    attributes: String,
}

impl From<&Host> for HostRow {
    fn from(host: &Host) -> Self {
        let resources = host
            .resources
            .iter()
            .map(|(name, residual)| match host.advertised.get(name) {
                Some(total) => format!("{name}={}/{}", residual.value, total.value),
                None => format!("{name}={}", residual.value),
            })
            .collect::<Vec<_>>()
            .join(" ");
        let attributes = host
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            id: host.id.to_string(),
            jobs: host.jobs.len(),
            resources,
            ports: host
                .port_range
                .map(|range| format!("{} ({} used)", range, host.ports_in_use())),
            attributes,
        }
    }
}

fn print_state(state: &ClusterSnapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_single(state),
        OutputFormat::Table => {
            let rows: Vec<HostRow> = state.hosts.values().map(HostRow::from).collect();
            print_output(&rows, format);
        }
    }
}

pub async fn state(ctx: CommandContext) -> Result<()> {
    let state = ctx
        .endpoints
        .scheduler()
        .await?
        .state()
        .await
        .map_err(CliError::from)?;
    print_state(&state, ctx.format);
    Ok(())
}

pub async fn watch(ctx: CommandContext) -> Result<()> {
    let client = ctx.endpoints.scheduler().await?;
    let mut stream = client.stream_state().await.map_err(CliError::from)?;
    while let Some(state) = stream.next().await.map_err(CliError::from)? {
        match ctx.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&state)?),
            OutputFormat::Table => {
                println!(
                    "{} hosts, {} jobs at {}",
                    state.hosts.len(),
                    state.job_count(),
                    chrono::Utc::now().format("%H:%M:%S")
                );
                print_state(&state, ctx.format);
            }
        }
    }
    Ok(())
}

/// Reads a placement file.
fn load_host_jobs(path: &Path) -> Result<HostJobs> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Serialize, Tabled)]
struct RejectionRow {
    #[tabled(rename = "JOB")]
    job: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "REASON")]
    reason: String,
}

pub async fn schedule(ctx: CommandContext, args: ScheduleArgs) -> Result<()> {
    let host_jobs = load_host_jobs(&args.file)?;
    let total = host_jobs.job_count();
    let request = if args.incremental {
        ScheduleRequest::incremental(host_jobs)
    } else {
        ScheduleRequest::atomic(host_jobs)
    };

    let response = ctx
        .endpoints
        .scheduler()
        .await?
        .schedule(request)
        .await
        .map_err(CliError::from)?;

    if ctx.format == OutputFormat::Json {
        print_single(&response);
        return Ok(());
    }

    let placed = total.saturating_sub(response.remaining.len());
    if response.success {
        print_success(&format!("placed {placed} of {total} jobs"));
    } else {
        print_warning(&format!("placed {placed} of {total} jobs"));
    }
    let rows: Vec<RejectionRow> = response
        .rejections
        .iter()
        .map(|r| RejectionRow {
            job: r.job_id.to_string(),
            host: r.host_id.to_string(),
            reason: r.reason.to_string(),
        })
        .collect();
    if !rows.is_empty() {
        print_output(&rows, ctx.format);
    }
    if !response.success {
        anyhow::bail!("{} jobs were not placed", response.remaining.len());
    }
    Ok(())
}
