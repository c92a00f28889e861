//! Cluster data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use corral_events::JobStatus;
use corral_id::{HostId, JobId};
use serde::{Deserialize, Serialize};

use crate::ProtoError;

// =============================================================================
// Jobs
// =============================================================================

/// A unit of work. Immutable after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    #[serde(default)]
    pub container_image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Number of externally reachable ports the job needs.
    #[serde(default)]
    pub tcp_ports: u32,

    /// Resource demands by name.
    #[serde(default)]
    pub resources: BTreeMap<String, i64>,

    /// Attributes matched against host placement rules.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    /// Metadata key naming the service a job announces in the registry.
    pub const SERVICE_NAME_KEY: &'static str = "service_name";

    pub fn new(id: JobId) -> Self {
        Self {
            id,
            container_image: String::new(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            tcp_ports: 0,
            resources: BTreeMap::new(),
            attributes: BTreeMap::new(),
            tty: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, demand: i64) -> Self {
        self.resources.insert(name.into(), demand);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tcp_ports(mut self, count: u32) -> Self {
        self.tcp_ports = count;
        self
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// The registry service this job announces itself under, if any.
    pub fn service_name(&self) -> Option<&str> {
        self.metadata
            .get(Self::SERVICE_NAME_KEY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Hosts
// =============================================================================

/// An advertised resource amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceValue {
    pub value: i64,
    #[serde(default)]
    pub overcommit: bool,
}

impl ResourceValue {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            overcommit: false,
        }
    }

    pub fn overcommitted(value: i64) -> Self {
        Self {
            value,
            overcommit: true,
        }
    }
}

/// Inclusive range of host ports handed out to jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Result<Self, ProtoError> {
        if low > high || low == 0 {
            return Err(ProtoError::InvalidPortRange { low, high });
        }
        Ok(Self { low, high })
    }

    /// Number of ports in the range.
    pub fn size(&self) -> u32 {
        u32::from(self.high) - u32::from(self.low) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.low..=self.high).contains(&port)
    }
}

impl std::str::FromStr for PortRange {
    type Err = ProtoError;

    /// Parses `low-high`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtoError::InvalidPortRange { low: 0, high: 0 };
        let (low, high) = s.trim().split_once('-').ok_or_else(invalid)?;
        let low = low.trim().parse().map_err(|_| invalid())?;
        let high = high.trim().parse().map_err(|_| invalid())?;
        Self::new(low, high)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// Comparison applied by a placement rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "!=", alias = "≠")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=", alias = "≥")]
    GtEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    LtEq,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
        };
        f.write_str(s)
    }
}

/// A placement constraint `(key, op, value)` evaluated against job attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub key: String,
    pub op: Operator,
    pub value: String,
}

impl Rule {
    pub fn new(key: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.key, self.op, self.value)
    }
}

/// A host as advertised to the scheduler and as tracked in the cluster state.
///
/// `resources` holds the residual amounts after subtracting the demands of
/// `jobs`; `advertised` holds what the host originally offered. A host sending
/// its advertisement fills in `resources` and leaves `advertised` empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,

    #[serde(default)]
    pub resources: BTreeMap<String, ResourceValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub advertised: BTreeMap<String, ResourceValue>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub jobs: Vec<Job>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<PortRange>,
}

impl Host {
    pub fn new(id: HostId) -> Self {
        Self {
            id,
            resources: BTreeMap::new(),
            advertised: BTreeMap::new(),
            attributes: BTreeMap::new(),
            rules: Vec::new(),
            jobs: Vec::new(),
            port_range: None,
        }
    }

    pub fn with_resource(mut self, name: impl Into<String>, value: ResourceValue) -> Self {
        self.resources.insert(name.into(), value);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_range = Some(range);
        self
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| &j.id == id)
    }

    /// Ports requested by the jobs currently placed on this host.
    pub fn ports_in_use(&self) -> u32 {
        self.jobs.iter().map(|j| j.tcp_ports).sum()
    }
}

/// The scheduler's authoritative `host_id → Host` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterSnapshot {
    pub hosts: BTreeMap<HostId, Host>,
}

impl ClusterSnapshot {
    pub fn host(&self, id: &HostId) -> Option<&Host> {
        self.hosts.get(id)
    }

    /// Total number of jobs placed across all hosts.
    pub fn job_count(&self) -> usize {
        self.hosts.values().map(|h| h.jobs.len()).sum()
    }
}

// =============================================================================
// Active jobs
// =============================================================================

/// Host-side runtime record of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job: Job,
    pub host_id: HostId,
    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,

    /// Present iff the job crashed or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub allocated_ports: Vec<u16>,

    /// A stop was requested and the exit has not been reported yet.
    #[serde(default)]
    pub stop_requested: bool,
}

impl ActiveJob {
    pub fn new(job: Job, host_id: HostId) -> Self {
        Self {
            job,
            host_id,
            status: JobStatus::Starting,
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            signal: None,
            error: None,
            allocated_ports: Vec::new(),
            stop_requested: false,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("\"=\"", Operator::Eq)]
    #[case("\"!=\"", Operator::NotEq)]
    #[case("\"≠\"", Operator::NotEq)]
    #[case("\">=\"", Operator::GtEq)]
    #[case("\"≥\"", Operator::GtEq)]
    #[case("\"≤\"", Operator::LtEq)]
    fn test_operator_spellings(#[case] json: &str, #[case] expected: Operator) {
        assert_eq!(serde_json::from_str::<Operator>(json).unwrap(), expected);
    }

    #[test]
    fn test_job_defaults_from_minimal_json() {
        let job: Job = serde_json::from_str(r#"{"id":"j1","resources":{"memory":512}}"#).unwrap();
        assert_eq!(job.resources["memory"], 512);
        assert_eq!(job.tcp_ports, 0);
        assert!(!job.tty);
        assert!(job.service_name().is_none());
    }

    #[test]
    fn test_port_range_parse() {
        let range: PortRange = "55000-65535".parse().unwrap();
        assert_eq!(range.size(), 10536);
        assert!(range.contains(55000));
        assert!(!range.contains(54999));
        assert!("10-5".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_host_advertised_omitted_when_empty() {
        let host = Host::new(HostId::parse("h1").unwrap())
            .with_resource("memory", ResourceValue::new(1024));
        let value = serde_json::to_value(&host).unwrap();
        assert!(value.get("advertised").is_none());
        assert_eq!(value["resources"]["memory"]["value"], 1024);
        assert_eq!(value["resources"]["memory"]["overcommit"], false);
    }

    #[test]
    fn test_ports_in_use() {
        let mut host = Host::new(HostId::parse("h1").unwrap());
        host.jobs.push(Job::new(JobId::parse("a").unwrap()).with_tcp_ports(2));
        host.jobs.push(Job::new(JobId::parse("b").unwrap()).with_tcp_ports(1));
        assert_eq!(host.ports_in_use(), 3);
    }
}
