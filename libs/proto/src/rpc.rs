//! Scheduler RPC messages.
//!
//! A client frame carries one [`Request`]; the server answers unary requests
//! with one [`Response`]. `RegisterHost` and `StreamState` turn the connection
//! into a server-push stream that lasts until either side closes it.

use std::fmt;

use corral_id::{HostId, JobId};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::types::{ClusterSnapshot, Host, Job};

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Request {
    /// Read a consistent snapshot of the cluster.
    State,

    /// Receive the current snapshot, then one snapshot per commit.
    StreamState,

    /// Place jobs on hosts.
    Schedule(ScheduleRequest),

    /// Join the cluster and receive jobs on this connection.
    RegisterHost(Host),

    /// Report that jobs reached a terminal state.
    RemoveJobs { host_id: HostId, job_ids: Vec<JobId> },
}

/// Jobs to place, grouped by host, in submission order.
///
/// Serialized as a JSON object; deserialization keeps the order in which the
/// keys appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostJobs(Vec<(HostId, Vec<Job>)>);

impl HostJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `jobs` for `host`, merging with an earlier entry for the same host.
    pub fn push(&mut self, host: HostId, jobs: Vec<Job>) {
        match self.0.iter_mut().find(|(h, _)| *h == host) {
            Some((_, existing)) => existing.extend(jobs),
            None => self.0.push((host, jobs)),
        }
    }

    pub fn with(mut self, host: HostId, jobs: Vec<Job>) -> Self {
        self.push(host, jobs);
        self
    }

    /// Iterates `(host, job)` pairs in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (&HostId, &Job)> {
        self.0
            .iter()
            .flat_map(|(host, jobs)| jobs.iter().map(move |job| (host, job)))
    }

    /// Number of jobs across all hosts.
    pub fn job_count(&self) -> usize {
        self.0.iter().map(|(_, jobs)| jobs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.job_count() == 0
    }
}

impl Serialize for HostJobs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (host, jobs) in &self.0 {
            map.serialize_entry(host, jobs)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HostJobs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HostJobsVisitor;

        impl<'de> Visitor<'de> for HostJobsVisitor {
            type Value = HostJobs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map from host id to a list of jobs")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<HostJobs, A::Error> {
                let mut out = HostJobs::new();
                while let Some((host, jobs)) = access.next_entry::<HostId, Vec<Job>>()? {
                    out.push(host, jobs);
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(HostJobsVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub incremental: bool,
    pub host_jobs: HostJobs,
}

impl ScheduleRequest {
    pub fn atomic(host_jobs: HostJobs) -> Self {
        Self {
            incremental: false,
            host_jobs,
        }
    }

    pub fn incremental(host_jobs: HostJobs) -> Self {
        Self {
            incremental: true,
            host_jobs,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    State(ClusterSnapshot),
    Schedule(ScheduleResponse),
    Registered { host_id: HostId },
    Job(Job),
    Ack,
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub success: bool,
    pub state: ClusterSnapshot,
    #[serde(default)]
    pub remaining: Vec<Job>,
    #[serde(default)]
    pub rejections: Vec<Rejection>,
}

/// Why a job was not placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownHost,
    DuplicateJob,
    RuleMismatch { rule: String },
    InsufficientResource { resource: String, requested: i64, available: i64 },
    /// A resource demand below zero.
    InvalidDemand { resource: String, requested: i64 },
    PortPoolTooSmall { requested: u32, pool_size: u32 },
    InsufficientPorts { requested: u32, available: u32 },
    HostStalled,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownHost => f.write_str("unknown host"),
            RejectReason::DuplicateJob => f.write_str("duplicate job id"),
            RejectReason::RuleMismatch { rule } => write!(f, "rule not satisfied: {rule}"),
            RejectReason::InsufficientResource {
                resource,
                requested,
                available,
            } => write!(
                f,
                "insufficient {resource}: requested {requested}, available {available}"
            ),
            RejectReason::InvalidDemand {
                resource,
                requested,
            } => write!(f, "invalid {resource} demand {requested}"),
            RejectReason::PortPoolTooSmall {
                requested,
                pool_size,
            } => write!(
                f,
                "requested {requested} ports but the host pool only has {pool_size}"
            ),
            RejectReason::InsufficientPorts {
                requested,
                available,
            } => write!(f, "requested {requested} ports, {available} free"),
            RejectReason::HostStalled => f.write_str("host channel did not accept the job in time"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub job_id: JobId,
    pub host_id: HostId,
    #[serde(flatten)]
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    DuplicateRegistration,
    InvalidAdvertisement,
    RegistryUnavailable,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
