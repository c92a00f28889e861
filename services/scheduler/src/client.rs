//! Typed client for the scheduler RPC port.

use std::time::Duration;

use corral_id::{HostId, JobId};
use corral_proto::{
    ClientCodec, ClusterSnapshot, Host, Job, ProtoError, Request, Response, RpcError,
    ScheduleRequest, ScheduleResponse,
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

/// Default bound on connecting and on a unary call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("scheduler returned an error: {0}")]
    Rpc(#[from] RpcError),

    #[error("connection closed by scheduler")]
    Closed,

    #[error("scheduler did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

type Connection = Framed<TcpStream, ClientCodec>;

/// A connection to the scheduler serving sequential unary calls.
pub struct SchedulerClient {
    conn: Connection,
    timeout: Duration,
}

impl SchedulerClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(DEFAULT_TIMEOUT))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            conn: Framed::new(stream, ClientCodec::new()),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        self.conn.send(request).await?;
        let timeout = self.timeout;
        let frame = tokio::time::timeout(timeout, self.conn.next())
            .await
            .map_err(|_| ClientError::Timeout(timeout))?;
        match frame {
            Some(Ok(Response::Error(e))) => Err(e.into()),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::Closed),
        }
    }

    pub async fn state(&mut self) -> Result<ClusterSnapshot, ClientError> {
        match self.call(Request::State).await? {
            Response::State(snapshot) => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn schedule(&mut self, request: ScheduleRequest) -> Result<ScheduleResponse, ClientError> {
        match self.call(Request::Schedule(request)).await? {
            Response::Schedule(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn remove_jobs(&mut self, host_id: HostId, job_ids: Vec<JobId>) -> Result<(), ClientError> {
        match self.call(Request::RemoveJobs { host_id, job_ids }).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Registers `host` and turns the connection into its job stream.
    pub async fn register_host(mut self, host: Host) -> Result<HostStream, ClientError> {
        match self.call(Request::RegisterHost(host)).await? {
            Response::Registered { host_id } => Ok(HostStream {
                host_id,
                conn: self.conn,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Turns the connection into a stream of committed snapshots, starting
    /// with the current one.
    pub async fn stream_state(mut self) -> Result<StateStream, ClientError> {
        self.conn.send(Request::StreamState).await?;
        Ok(StateStream { conn: self.conn })
    }
}

fn unexpected(response: &Response) -> ClientError {
    ClientError::Unexpected(format!("{response:?}"))
}

/// Jobs sent to a registered host.
pub struct HostStream {
    host_id: HostId,
    conn: Connection,
}

impl HostStream {
    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    /// The next job, or `None` once the scheduler closed the stream.
    pub async fn next_job(&mut self) -> Result<Option<Job>, ClientError> {
        match self.conn.next().await {
            Some(Ok(Response::Job(job))) => Ok(Some(job)),
            Some(Ok(Response::Error(e))) => Err(e.into()),
            Some(Ok(other)) => Err(unexpected(&other)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Cluster snapshots pushed after every commit.
pub struct StateStream {
    conn: Connection,
}

impl StateStream {
    pub async fn next(&mut self) -> Result<Option<ClusterSnapshot>, ClientError> {
        match self.conn.next().await {
            Some(Ok(Response::State(snapshot))) => Ok(Some(snapshot)),
            Some(Ok(Response::Error(e))) => Err(e.into()),
            Some(Ok(other)) => Err(unexpected(&other)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}
