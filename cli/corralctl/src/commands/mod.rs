//! CLI commands.

mod cluster;
mod events;
mod jobs;
mod log;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::output::OutputFormat;
use crate::resolve::Endpoints;

/// corral - place jobs on hosts and inspect them.
#[derive(Debug, Parser)]
#[command(name = "corralctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Scheduler address (host:port). Defaults to the registry leader.
    #[arg(long, global = true, env = "CORRAL_SCHEDULER_URL")]
    scheduler: Option<String>,

    /// Service registry URL.
    #[arg(long, global = true, env = "CORRAL_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Host agent URL, bypassing the registry lookup.
    #[arg(long, global = true, env = "CORRAL_HOST_URL")]
    host_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the cluster state.
    State,

    /// Print the cluster state after every change.
    Watch,

    /// Place jobs from a JSON file mapping host ids to job lists.
    Schedule(cluster::ScheduleArgs),

    /// List placed jobs.
    Ps,

    /// Show a job as recorded by its host.
    Inspect(jobs::JobArgs),

    /// Stop a job gracefully.
    Stop(jobs::JobArgs),

    /// Print a job's output.
    Log(log::LogArgs),

    /// Stream job lifecycle events from a host.
    Events(events::EventsArgs),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: self.format,
            endpoints: Endpoints {
                scheduler: self.scheduler,
                registry_url: self.registry_url,
                host_url: self.host_url,
            },
        };

        match self.command {
            Commands::State => cluster::state(ctx).await,
            Commands::Watch => cluster::watch(ctx).await,
            Commands::Schedule(args) => cluster::schedule(ctx, args).await,
            Commands::Ps => jobs::ps(ctx).await,
            Commands::Inspect(args) => jobs::inspect(ctx, args).await,
            Commands::Stop(args) => jobs::stop(ctx, args).await,
            Commands::Log(args) => log::log(ctx, args).await,
            Commands::Events(args) => events::events(ctx, args).await,
            Commands::Version => {
                println!("corralctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub endpoints: Endpoints,
}
