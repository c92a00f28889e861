//! `corralctl events`: lifecycle events from a host agent.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use corral_events::{Event, EventKind};
use corral_id::{HostId, JobId};

use crate::error::CliError;
use crate::output::OutputFormat;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Only this job's events, ending when it finishes.
    job: Option<String>,

    /// Host to read from when no job is given.
    #[arg(long)]
    host: Option<String>,
}

fn render(event: &Event) -> String {
    let kind = match event.kind {
        EventKind::Create => "create".normal(),
        EventKind::Start => "start".green(),
        EventKind::Stop => "stop".yellow(),
        EventKind::Error => "error".red(),
    };
    let mut line = format!(
        "{} {:<6} {} on {} ({})",
        event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        kind,
        event.job_id,
        event.host_id,
        event.status()
    );
    if let Some(details) = &event.details {
        if let Some(code) = details.exit_code {
            line.push_str(&format!(" exit={code}"));
        }
        if let Some(signal) = details.signal {
            line.push_str(&format!(" signal={signal}"));
        }
        if let Some(error) = &details.error {
            line.push_str(&format!(" error={error:?}"));
        }
    }
    line
}

pub async fn events(ctx: CommandContext, args: EventsArgs) -> Result<()> {
    let mut stream = match (&args.job, &args.host) {
        (Some(job), _) => {
            let job_id = JobId::parse(job)?;
            let (_, host) = ctx.endpoints.host_of(&job_id).await?;
            host.job_events(&job_id).await.map_err(CliError::from)?
        }
        (None, Some(host)) => {
            let host = ctx.endpoints.host(&HostId::parse(host)?).await?;
            host.events().await.map_err(CliError::from)?
        }
        (None, None) => {
            let state = ctx
                .endpoints
                .scheduler()
                .await?
                .state()
                .await
                .map_err(CliError::from)?;
            let mut hosts = state.hosts.keys();
            let (Some(only), None) = (hosts.next(), hosts.next()) else {
                anyhow::bail!("the cluster has several hosts, pass --host or a job id");
            };
            let host = ctx.endpoints.host(only).await?;
            host.events().await.map_err(CliError::from)?
        }
    };

    while let Some(event) = stream.next_event().await.map_err(CliError::from)? {
        match ctx.format {
            OutputFormat::Json => print!("{}", event.to_ndjson()?),
            OutputFormat::Table => println!("{}", render(&event)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_events::EventDetails;

    #[test]
    fn test_render_stop_details() {
        colored::control::set_override(false);
        let event = Event::new(
            EventKind::Stop,
            JobId::parse("j1").unwrap(),
            HostId::parse("h1").unwrap(),
        )
        .with_details(EventDetails {
            exit_code: Some(2),
            ..Default::default()
        });
        let line = render(&event);
        assert!(line.contains("stop"), "{line}");
        assert!(line.contains("j1 on h1 (crashed)"), "{line}");
        assert!(line.ends_with("exit=2"), "{line}");
    }
}
