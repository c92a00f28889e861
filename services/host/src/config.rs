//! Configuration for the host agent.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use corral_id::HostId;
use corral_proto::{Host, PortRange, ResourceValue, Rule};
use serde::Deserialize;

/// Which executor runs jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Process,
    Mock,
}

impl FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(ExecutorKind::Process),
            "mock" => Ok(ExecutorKind::Mock),
            other => bail!("unknown executor `{other}`, expected `process` or `mock`"),
        }
    }
}

/// Static description of the host, read from `CORRAL_HOST_CONFIG`.
///
/// ```toml
/// external_ip = "10.0.0.5"
/// port_range = { low = 55000, high = 56000 }
///
/// [resources]
/// memory = { value = 4096 }
/// cpu = { value = 4000, overcommit = true }
///
/// [attributes]
/// zone = "a"
///
/// [[rules]]
/// key = "tier"
/// op = "="
/// value = "web"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostFile {
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceValue>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub rules: Vec<Rule>,

    pub port_range: Option<PortRange>,

    pub external_ip: Option<String>,
}

impl HostFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading host config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing host config {}", path.display()))
    }
}

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit host id; otherwise the persisted instance id is used.
    pub host_id: Option<HostId>,

    /// Where the instance id is persisted.
    pub data_dir: PathBuf,

    /// Address the HTTP API binds.
    pub http_addr: SocketAddr,

    /// Static scheduler address; `None` follows the registry leader.
    pub scheduler_addr: Option<String>,

    /// Registry base URL; `None` selects the in-process registry.
    pub registry_url: Option<String>,

    pub executor: ExecutorKind,

    /// Time between SIGTERM and SIGKILL when stopping a job.
    pub stop_grace: Duration,

    /// How long finished jobs stay visible.
    pub job_retention: Duration,

    /// How long an attach waits for its job to start.
    pub attach_wait: Duration,

    /// Address other machines reach this host's job ports on.
    pub external_ip: String,

    pub port_range: PortRange,

    pub resources: BTreeMap<String, ResourceValue>,
    pub attributes: BTreeMap<String, String>,
    pub rules: Vec<Rule>,
}

fn parse_var<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    what: &str,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be {what}")),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables and the optional host
    /// file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host_id = match var("CORRAL_HOST_ID").filter(|s| !s.is_empty()) {
            Some(raw) => Some(HostId::parse(&raw).context("CORRAL_HOST_ID is not a valid id")?),
            None => None,
        };

        let file = match var("CORRAL_HOST_CONFIG").filter(|s| !s.is_empty()) {
            Some(path) => HostFile::load(Path::new(&path))?,
            None => HostFile::default(),
        };

        let http_addr: SocketAddr = parse_var(
            &var,
            "CORRAL_HTTP_ADDR",
            SocketAddr::from(([0, 0, 0, 0], 1113)),
            "a socket address",
        )?;
        let env_range: PortRange = parse_var(
            &var,
            "CORRAL_PORT_RANGE",
            PortRange { low: 55000, high: 65535 },
            "a range like 55000-65535",
        )?;
        let executor = parse_var(&var, "CORRAL_EXECUTOR", ExecutorKind::Process, "process or mock")?;
        let stop_grace: u64 = parse_var(&var, "CORRAL_STOP_GRACE_SECS", 10, "a number of seconds")?;
        let retention: u64 =
            parse_var(&var, "CORRAL_JOB_RETENTION_SECS", 3600, "a number of seconds")?;
        let attach_wait: u64 =
            parse_var(&var, "CORRAL_ATTACH_WAIT_SECS", 60, "a number of seconds")?;

        let port_range = match var("CORRAL_PORT_RANGE") {
            Some(_) => env_range,
            None => file.port_range.unwrap_or(env_range),
        };

        Ok(Self {
            host_id,
            data_dir: var("CORRAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/data")),
            http_addr,
            scheduler_addr: var("CORRAL_SCHEDULER_URL").filter(|s| !s.is_empty()),
            registry_url: var("CORRAL_REGISTRY_URL").filter(|s| !s.is_empty()),
            executor,
            stop_grace: Duration::from_secs(stop_grace),
            job_retention: Duration::from_secs(retention),
            attach_wait: Duration::from_secs(attach_wait),
            external_ip: file
                .external_ip
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port_range,
            resources: file.resources,
            attributes: file.attributes,
            rules: file.rules,
        })
    }

    /// The advertisement sent on every registration, without jobs.
    pub fn host_template(&self, host_id: HostId) -> Host {
        Host {
            id: host_id,
            resources: self.resources.clone(),
            advertised: BTreeMap::new(),
            attributes: self.attributes.clone(),
            rules: self.rules.clone(),
            jobs: Vec::new(),
            port_range: Some(self.port_range),
        }
    }

    /// Address registered for this host's HTTP API.
    pub fn http_advertise_addr(&self) -> String {
        format!("{}:{}", self.external_ip, self.http_addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_proto::Operator;
    use std::collections::HashMap;
    use std::io::Write;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert!(config.host_id.is_none());
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.http_addr.port(), 1113);
        assert_eq!(config.port_range, PortRange::new(55000, 65535).unwrap());
        assert_eq!(config.executor, ExecutorKind::Process);
        assert_eq!(config.stop_grace, Duration::from_secs(10));
        assert_eq!(config.job_retention, Duration::from_secs(3600));
        assert_eq!(config.attach_wait, Duration::from_secs(60));
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_host_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
external_ip = "10.0.0.5"
port_range = {{ low = 6000, high = 6099 }}

[resources]
memory = {{ value = 4096 }}
cpu = {{ value = 4000, overcommit = true }}

[attributes]
zone = "a"

[[rules]]
key = "tier"
op = "="
value = "web"
"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = load(&[("CORRAL_HOST_CONFIG", &path), ("CORRAL_HOST_ID", "h1")]).unwrap();
        assert_eq!(config.external_ip, "10.0.0.5");
        assert_eq!(config.port_range.size(), 100);
        assert!(config.resources["cpu"].overcommit);
        assert_eq!(config.rules[0].op, Operator::Eq);

        let host = config.host_template(HostId::parse("h1").unwrap());
        assert_eq!(host.resources["memory"].value, 4096);
        assert_eq!(host.attributes["zone"], "a");
        assert_eq!(host.port_range, Some(config.port_range));
        assert_eq!(config.http_advertise_addr(), "10.0.0.5:1113");

        let overridden = load(&[("CORRAL_HOST_CONFIG", &path), ("CORRAL_PORT_RANGE", "7000-7001")])
            .unwrap();
        assert_eq!(overridden.port_range.size(), 2);
    }

    #[test]
    fn test_invalid_values_fail() {
        assert!(load(&[("CORRAL_EXECUTOR", "docker")]).is_err());
        assert!(load(&[("CORRAL_PORT_RANGE", "9-1")]).is_err());
        assert!(load(&[("CORRAL_HTTP_ADDR", "nowhere")]).is_err());
        assert!(load(&[("CORRAL_HOST_ID", "a/b")]).is_err());
        assert!(load(&[("CORRAL_HOST_CONFIG", "/nonexistent/corral.toml")]).is_err());
    }
}
