//! Scheduler error types.

use corral_id::{HostId, JobId};
use corral_proto::{RpcError, RpcErrorKind};
use thiserror::Error;

/// A broken cluster-state invariant. Always fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("restoring {resource} on host {host_id} gives {residual}, above the advertised {advertised}")]
    ResourceOverflow {
        host_id: HostId,
        resource: String,
        residual: i64,
        advertised: i64,
    },

    #[error("{resource} on host {host_id} has residual {residual}, expected {expected} from its jobs")]
    ResidualMismatch {
        host_id: HostId,
        resource: String,
        residual: i64,
        expected: i64,
    },

    #[error("job {job_id} is indexed on host {host_id} but the host does not hold it")]
    IndexMismatch { job_id: JobId, host_id: HostId },
}

/// Reasons a host registration is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("host {0} is already registered")]
    DuplicateRegistration(HostId),

    #[error("host {host_id} advertises jobs needing {demand} {resource} but only {advertised} is available")]
    ResourceOverrun {
        host_id: HostId,
        resource: String,
        demand: i64,
        advertised: i64,
    },

    #[error("job {job_id} needs resource {resource} which host {host_id} does not advertise")]
    UnknownResource {
        host_id: HostId,
        job_id: JobId,
        resource: String,
    },

    #[error("job {job_id} demands {demand} {resource}, below zero")]
    InvalidDemand {
        job_id: JobId,
        resource: String,
        demand: i64,
    },

    #[error("job {job_id} is advertised twice by host {host_id}")]
    DuplicateJob { host_id: HostId, job_id: JobId },

    #[error("job {job_id} is already placed on host {other}")]
    JobElsewhere { job_id: JobId, other: HostId },

    #[error("service registry is unavailable")]
    RegistryUnavailable,
}

impl From<AdmissionError> for RpcError {
    fn from(err: AdmissionError) -> Self {
        let kind = match err {
            AdmissionError::DuplicateRegistration(_) => RpcErrorKind::DuplicateRegistration,
            AdmissionError::RegistryUnavailable => RpcErrorKind::RegistryUnavailable,
            _ => RpcErrorKind::InvalidAdvertisement,
        };
        RpcError::new(kind, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Admission(#[from] AdmissionError),
}
