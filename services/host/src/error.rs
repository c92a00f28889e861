//! Host agent error types.

use corral_events::JobStatus;
use corral_id::JobId;
use corral_proto::ProtoError;
use thiserror::Error;

/// Job State Table errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is already active on this host")]
    Duplicate(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

impl StateError {
    /// Whether the error means the table's invariants are broken.
    pub fn is_invariant(&self) -> bool {
        !matches!(self, StateError::NotFound(_))
    }
}

/// Port Pool errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("requested {requested} ports but the pool only has {pool_size}")]
    PoolTooSmall { requested: u32, pool_size: u32 },

    #[error("requested {requested} ports, {available} free")]
    Exhausted { requested: u32, available: u32 },
}

/// Executor failures.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("image unavailable: {0}")]
    ImageUnavailable(String),

    #[error("create failed: {0}")]
    Create(String),

    #[error("start failed: {0}")]
    Start(String),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Attach failures, reported to the client after an `error` status byte.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is not running")]
    NotRunning(JobId),

    #[error("job {0} did not start in time")]
    Timeout(JobId),

    #[error("job {0} failed before it started: {1}")]
    Failed(JobId, String),

    #[error("invalid attach request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of one registration or removal round trip with the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerLinkError {
    #[error("no scheduler leader is known")]
    NoLeader,

    #[error(transparent)]
    Registry(#[from] corral_registry::RegistryError),

    #[error(transparent)]
    Client(#[from] corral_scheduler::ClientError),
}

/// Failures talking to a host agent's HTTP API.
#[derive(Debug, Error)]
pub enum HostClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{}: {}", .problem.title, .problem.detail)]
    Api {
        status: u16,
        problem: Box<crate::api::ProblemDetails>,
    },

    #[error("attach refused: {0}")]
    Refused(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Event(#[from] corral_events::EventError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
