//! `corralctl log`: job output through the attach protocol.

use anyhow::Result;
use clap::Args;
use corral_host::Attached;
use corral_id::JobId;
use corral_proto::attach::{AttachFlags, AttachFrame, AttachReq, StreamId};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::CliError;
use crate::output::print_info;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Job ID.
    job: String,

    /// Keep streaming until the job exits.
    #[arg(short, long)]
    follow: bool,
}

fn request(job_id: JobId, follow: bool) -> AttachReq {
    let mut flags = AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::LOGS;
    if follow {
        flags = flags | AttachFlags::STREAM;
    }
    let mut req = AttachReq::new(job_id, flags);
    req.wait = follow;
    req
}

pub async fn log(ctx: CommandContext, args: LogArgs) -> Result<()> {
    let job_id = JobId::parse(&args.job)?;
    let (_, host) = ctx.endpoints.host_of(&job_id).await?;
    let job = host.get_job(&job_id).await.map_err(CliError::from)?;

    let session = match host
        .attach(&request(job_id.clone(), args.follow))
        .await
        .map_err(CliError::from)?
    {
        Attached::Session(session) => session,
        Attached::WouldWait => {
            print_info(&format!("job {job_id} has not started yet"));
            return Ok(());
        }
    };

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    if job.job.tty {
        let mut raw = session.into_raw();
        tokio::io::copy(&mut raw, &mut stdout).await?;
        stdout.flush().await?;
        return Ok(());
    }

    let mut framed = session.framed();
    while let Some(frame) = framed.next().await {
        match frame? {
            AttachFrame::Data { stream: StreamId::Stderr, data } => {
                stderr.write_all(&data).await?;
            }
            AttachFrame::Data { data, .. } => stdout.write_all(&data).await?,
            AttachFrame::Exit(code) => {
                stdout.flush().await?;
                print_info(&format!("job {job_id} exited with code {code}"));
            }
            AttachFrame::Error(msg) => anyhow::bail!("host reported: {msg}"),
            AttachFrame::Signal(_) | AttachFrame::Resize { .. } => {}
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;
    Ok(())
}
