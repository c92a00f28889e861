//! Scheduler RPC server.
//!
//! One task per TCP connection. A connection serves unary calls until it
//! sends `RegisterHost` or `StreamState`, after which it belongs to that
//! stream until either side closes it.

use std::net::SocketAddr;
use std::sync::Arc;

use corral_proto::{Host, ProtoError, Request, Response, RpcError, RpcErrorKind, ServerCodec};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::schedule::Scheduler;

type Connection = Framed<TcpStream, ServerCodec>;

/// Accepts connections until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "Scheduler RPC listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => {
                info!("Scheduler RPC server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let conn = Framed::new(stream, ServerCodec::new());
            if let Err(e) = handle_connection(conn, peer, scheduler, shutdown).await {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    mut conn: Connection,
    peer: SocketAddr,
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = conn.next() => frame,
        };
        let request = match frame {
            Some(Ok(request)) => request,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        };

        match request {
            Request::State => {
                let snapshot = scheduler.state().to_snapshot();
                conn.send(Response::State(snapshot)).await?;
            }
            Request::Schedule(request) => match scheduler.schedule(request).await {
                Ok(response) => conn.send(Response::Schedule(response)).await?,
                Err(e) => return fail(conn, e).await,
            },
            Request::RemoveJobs { host_id, job_ids } => {
                match scheduler.remove_jobs(&host_id, &job_ids).await {
                    Ok(()) => conn.send(Response::Ack).await?,
                    Err(e) => return fail(conn, e).await,
                }
            }
            Request::StreamState => return stream_state(conn, scheduler, shutdown).await,
            Request::RegisterHost(host) => {
                return host_stream(conn, peer, scheduler, host, shutdown).await
            }
        }
    }
}

async fn fail(mut conn: Connection, err: SchedulerError) -> Result<(), ProtoError> {
    let kind = match err {
        SchedulerError::Admission(ref e) => RpcError::from(e.clone()).kind,
        SchedulerError::Invariant(_) => RpcErrorKind::Internal,
    };
    conn.send(Response::Error(RpcError::new(kind, err.to_string())))
        .await
}

enum HostStep {
    Job(Option<corral_proto::Job>),
    Inbound(Option<Result<Request, ProtoError>>),
    Shutdown,
}

async fn host_stream(
    mut conn: Connection,
    peer: SocketAddr,
    scheduler: Arc<Scheduler>,
    host: Host,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    let mut registration = match scheduler.register_host(host).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Host registration refused");
            return conn.send(Response::Error(e.into())).await;
        }
    };
    let host_id = registration.host_id.clone();

    let result: Result<(), ProtoError> = async {
        conn.send(Response::Registered {
            host_id: host_id.clone(),
        })
        .await?;

        loop {
            let step = tokio::select! {
                job = registration.jobs.recv() => HostStep::Job(job),
                frame = conn.next() => HostStep::Inbound(frame),
                _ = shutdown.changed() => HostStep::Shutdown,
            };
            match step {
                HostStep::Job(Some(job)) => conn.send(Response::Job(job)).await?,
                HostStep::Job(None) | HostStep::Shutdown | HostStep::Inbound(None) => {
                    return Ok(())
                }
                HostStep::Inbound(Some(Err(e))) => return Err(e),
                HostStep::Inbound(Some(Ok(request))) => {
                    warn!(host_id = %host_id, ?request, "Ignoring request on host stream");
                }
            }
        }
    }
    .await;

    scheduler
        .deregister(&registration.host_id, registration.generation)
        .await;

    let mut undelivered = 0;
    while registration.jobs.try_recv().is_ok() {
        undelivered += 1;
    }
    if undelivered > 0 {
        warn!(host_id = %host_id, undelivered, "Dropped jobs queued for disconnected host");
    }
    result
}

enum StateStep {
    Commit(bool),
    Inbound(Option<Result<Request, ProtoError>>),
    Shutdown,
}

async fn stream_state(
    mut conn: Connection,
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    let mut commits = scheduler.subscribe();
    let snapshot = commits.borrow_and_update().to_snapshot();
    conn.send(Response::State(snapshot)).await?;

    loop {
        let step = tokio::select! {
            changed = commits.changed() => StateStep::Commit(changed.is_ok()),
            frame = conn.next() => StateStep::Inbound(frame),
            _ = shutdown.changed() => StateStep::Shutdown,
        };
        match step {
            StateStep::Commit(true) => {
                let snapshot = commits.borrow_and_update().to_snapshot();
                conn.send(Response::State(snapshot)).await?;
            }
            StateStep::Commit(false) | StateStep::Shutdown | StateStep::Inbound(None) => {
                return Ok(())
            }
            StateStep::Inbound(Some(Err(e))) => return Err(e),
            StateStep::Inbound(Some(Ok(_))) => {}
        }
    }
}
