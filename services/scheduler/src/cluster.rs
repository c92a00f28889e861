//! Cluster state.
//!
//! The committed state is an immutable [`Cluster`] published through an
//! [`ArcSwap`]. Readers load the pointer once and never block. Writers hold a
//! [`Transaction`], which serializes on a mutex, records changes in a
//! copy-on-write overlay of the hosts it touched and publishes a new
//! [`Cluster`] on commit. Dropping a transaction without committing rolls it
//! back.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use corral_id::{HostId, JobId};
use corral_proto::{ClusterSnapshot, Host, Job, RejectReason};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{AdmissionError, InvariantViolation};
use crate::rules::first_unmatched;

// =============================================================================
// Committed state
// =============================================================================

/// An immutable, committed view of the cluster.
#[derive(Debug, Default)]
pub struct Cluster {
    hosts: BTreeMap<HostId, Arc<Host>>,
    jobs: HashMap<JobId, HostId>,
    version: u64,
}

impl Cluster {
    pub fn host(&self, id: &HostId) -> Option<&Host> {
        self.hosts.get(id).map(Arc::as_ref)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values().map(Arc::as_ref)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The host a job is placed on.
    pub fn locate(&self, job_id: &JobId) -> Option<&HostId> {
        self.jobs.get(job_id)
    }

    /// Number of commits that produced this state.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn to_snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            hosts: self
                .hosts
                .iter()
                .map(|(id, host)| (id.clone(), Host::clone(host)))
                .collect(),
        }
    }
}

/// Holder of the committed cluster and entry point for transactions.
pub struct ClusterState {
    current: ArcSwap<Cluster>,
    writer: Mutex<()>,
    commits: watch::Sender<Arc<Cluster>>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> Self {
        let initial = Arc::new(Cluster::default());
        let (commits, _) = watch::channel(initial.clone());
        Self {
            current: ArcSwap::new(initial),
            writer: Mutex::new(()),
            commits,
        }
    }

    /// The latest committed state.
    pub fn get(&self) -> Arc<Cluster> {
        self.current.load_full()
    }

    /// Starts a transaction, waiting for any transaction in flight to finish.
    pub async fn begin(&self) -> Transaction<'_> {
        let guard = self.writer.lock().await;
        Transaction {
            state: self,
            _writer: guard,
            base: self.current.load_full(),
            hosts: BTreeMap::new(),
            jobs: HashMap::new(),
        }
    }

    /// Receives every committed state.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Cluster>> {
        self.commits.subscribe()
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// A single writer's pending changes.
pub struct Transaction<'a> {
    state: &'a ClusterState,
    _writer: MutexGuard<'a, ()>,
    base: Arc<Cluster>,
    /// Modified hosts; `None` marks a removal.
    hosts: BTreeMap<HostId, Option<Host>>,
    /// Modified job placements; `None` marks a removal.
    jobs: HashMap<JobId, Option<HostId>>,
}

impl Transaction<'_> {
    pub fn host(&self, id: &HostId) -> Option<&Host> {
        match self.hosts.get(id) {
            Some(entry) => entry.as_ref(),
            None => self.base.host(id),
        }
    }

    fn host_mut(&mut self, id: &HostId) -> Option<&mut Host> {
        if !self.hosts.contains_key(id) {
            let copy = self.base.host(id)?.clone();
            self.hosts.insert(id.clone(), Some(copy));
        }
        self.hosts.get_mut(id).and_then(Option::as_mut)
    }

    /// The host a job is placed on, including uncommitted placements.
    pub fn locate(&self, job_id: &JobId) -> Option<&HostId> {
        match self.jobs.get(job_id) {
            Some(entry) => entry.as_ref(),
            None => self.base.locate(job_id),
        }
    }

    /// Admits a host with the jobs it already runs.
    ///
    /// `host.resources` is taken as the advertised capacity; the residual is
    /// computed from the advertised jobs. A host already present is replaced.
    pub fn add_host(&mut self, mut host: Host) -> Result<(), AdmissionError> {
        let id = host.id.clone();
        if self.host(&id).is_some() {
            self.remove_host(&id);
        }

        host.advertised = host.resources.clone();
        let mut seen = HashSet::new();
        for job in &host.jobs {
            if !seen.insert(&job.id) {
                return Err(AdmissionError::DuplicateJob {
                    host_id: id.clone(),
                    job_id: job.id.clone(),
                });
            }
            if let Some(other) = self.locate(&job.id) {
                return Err(AdmissionError::JobElsewhere {
                    job_id: job.id.clone(),
                    other: other.clone(),
                });
            }
            for (name, demand) in &job.resources {
                if *demand < 0 {
                    return Err(AdmissionError::InvalidDemand {
                        job_id: job.id.clone(),
                        resource: name.clone(),
                        demand: *demand,
                    });
                }
                let Some(residual) = host.resources.get_mut(name) else {
                    if *demand > 0 {
                        return Err(AdmissionError::UnknownResource {
                            host_id: id.clone(),
                            job_id: job.id.clone(),
                            resource: name.clone(),
                        });
                    }
                    continue;
                };
                residual.value -= demand;
            }
        }

        for (name, residual) in &host.resources {
            if !residual.overcommit && residual.value < 0 {
                let advertised = host.advertised[name].value;
                return Err(AdmissionError::ResourceOverrun {
                    host_id: id.clone(),
                    resource: name.clone(),
                    demand: advertised - residual.value,
                    advertised,
                });
            }
        }

        for job in &host.jobs {
            self.jobs.insert(job.id.clone(), Some(id.clone()));
        }
        debug!(host_id = %id, jobs = host.jobs.len(), "Host added to transaction");
        self.hosts.insert(id, Some(host));
        Ok(())
    }

    /// Removes a host and drops its placements.
    pub fn remove_host(&mut self, id: &HostId) -> Option<Host> {
        let host = self.host(id)?.clone();
        for job in &host.jobs {
            self.jobs.insert(job.id.clone(), None);
        }
        self.hosts.insert(id.clone(), None);
        Some(host)
    }

    /// Places `job` on `host_id`, returning whether the host accepted it.
    pub fn add_job(&mut self, host_id: &HostId, job: Job) -> bool {
        self.try_add_job(host_id, job).is_ok()
    }

    /// Places `job` on `host_id` or says why it cannot be placed.
    pub fn try_add_job(&mut self, host_id: &HostId, job: Job) -> Result<(), RejectReason> {
        if self.locate(&job.id).is_some() {
            return Err(RejectReason::DuplicateJob);
        }
        let host = self.host(host_id).ok_or(RejectReason::UnknownHost)?;

        if let Some(rule) = first_unmatched(&host.rules, &job.attributes) {
            return Err(RejectReason::RuleMismatch {
                rule: rule.to_string(),
            });
        }

        if job.tcp_ports > 0 {
            if let Some(range) = host.port_range {
                if job.tcp_ports > range.size() {
                    return Err(RejectReason::PortPoolTooSmall {
                        requested: job.tcp_ports,
                        pool_size: range.size(),
                    });
                }
                let available = range.size().saturating_sub(host.ports_in_use());
                if job.tcp_ports > available {
                    return Err(RejectReason::InsufficientPorts {
                        requested: job.tcp_ports,
                        available,
                    });
                }
            }
        }

        for (name, &demand) in &job.resources {
            if demand < 0 {
                return Err(RejectReason::InvalidDemand {
                    resource: name.clone(),
                    requested: demand,
                });
            }
            if demand == 0 {
                continue;
            }
            match host.resources.get(name) {
                Some(res) if res.overcommit || res.value >= demand => {}
                Some(res) => {
                    return Err(RejectReason::InsufficientResource {
                        resource: name.clone(),
                        requested: demand,
                        available: res.value,
                    })
                }
                None => {
                    return Err(RejectReason::InsufficientResource {
                        resource: name.clone(),
                        requested: demand,
                        available: 0,
                    })
                }
            }
        }

        self.jobs.insert(job.id.clone(), Some(host_id.clone()));
        let host = self.host_mut(host_id).ok_or(RejectReason::UnknownHost)?;
        for (name, demand) in &job.resources {
            if let Some(res) = host.resources.get_mut(name) {
                res.value -= demand;
            }
        }
        host.jobs.push(job);
        Ok(())
    }

    /// Removes jobs from a host and restores their resources. Unknown hosts
    /// and jobs are ignored.
    pub fn remove_jobs(
        &mut self,
        host_id: &HostId,
        job_ids: &[JobId],
    ) -> Result<Vec<Job>, InvariantViolation> {
        let present = self
            .host(host_id)
            .is_some_and(|h| job_ids.iter().any(|id| h.job(id).is_some()));
        if !present {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        let Some(host) = self.host_mut(host_id) else {
            return Ok(removed);
        };
        for id in job_ids {
            let Some(pos) = host.jobs.iter().position(|j| &j.id == id) else {
                continue;
            };
            let job = host.jobs.remove(pos);
            for (name, demand) in &job.resources {
                let Some(res) = host.resources.get_mut(name) else {
                    continue;
                };
                res.value += demand;
                let advertised = host.advertised.get(name).map_or(0, |a| a.value);
                if res.value > advertised {
                    return Err(InvariantViolation::ResourceOverflow {
                        host_id: host_id.clone(),
                        resource: name.clone(),
                        residual: res.value,
                        advertised,
                    });
                }
            }
            removed.push(job);
        }
        check_residuals(host)?;
        for job in &removed {
            self.jobs.insert(job.id.clone(), None);
        }
        Ok(removed)
    }

    /// Whether the transaction has changed anything.
    pub fn is_dirty(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Publishes the changes and returns the new state.
    pub fn commit(self) -> Arc<Cluster> {
        if !self.is_dirty() {
            return self.base;
        }

        let mut hosts = self.base.hosts.clone();
        for (id, entry) in self.hosts {
            match entry {
                Some(host) => {
                    hosts.insert(id, Arc::new(host));
                }
                None => {
                    hosts.remove(&id);
                }
            }
        }
        let mut jobs = self.base.jobs.clone();
        for (id, entry) in self.jobs {
            match entry {
                Some(host) => {
                    jobs.insert(id, host);
                }
                None => {
                    jobs.remove(&id);
                }
            }
        }

        let next = Arc::new(Cluster {
            hosts,
            jobs,
            version: self.base.version + 1,
        });
        self.state.current.store(next.clone());
        self.state.commits.send_replace(next.clone());
        debug!(version = next.version, hosts = next.host_count(), jobs = next.job_count(), "Cluster state committed");
        next
    }

    /// Discards the changes and returns the unchanged state.
    pub fn rollback(self) -> Arc<Cluster> {
        self.base
    }
}

/// Checks that each resource's residual equals its advertised value less the
/// demands of the jobs the host holds.
pub fn check_residuals(host: &Host) -> Result<(), InvariantViolation> {
    for (name, res) in &host.resources {
        let advertised = host.advertised.get(name).map_or(0, |a| a.value);
        let demanded: i64 = host
            .jobs
            .iter()
            .filter_map(|j| j.resources.get(name))
            .sum();
        let expected = advertised - demanded;
        if res.value != expected {
            return Err(InvariantViolation::ResidualMismatch {
                host_id: host.id.clone(),
                resource: name.clone(),
                residual: res.value,
                expected,
            });
        }
    }
    Ok(())
}

/// Checks that every placement index entry matches a job on its host.
pub fn check_index(cluster: &Cluster) -> Result<(), InvariantViolation> {
    for (job_id, host_id) in &cluster.jobs {
        let held = cluster.host(host_id).is_some_and(|h| h.job(job_id).is_some());
        if !held {
            return Err(InvariantViolation::IndexMismatch {
                job_id: job_id.clone(),
                host_id: host_id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_proto::{Operator, PortRange, ResourceValue, Rule};

    fn host_id(s: &str) -> HostId {
        HostId::parse(s).unwrap()
    }

    fn job(id: &str, memory: i64) -> Job {
        Job::new(JobId::parse(id).unwrap()).with_resource("memory", memory)
    }

    fn h1() -> Host {
        Host::new(host_id("h1")).with_resource("memory", ResourceValue::new(1024))
    }

    async fn state_with(host: Host) -> ClusterState {
        let state = ClusterState::new();
        let mut tx = state.begin().await;
        tx.add_host(host).unwrap();
        tx.commit();
        state
    }

    #[tokio::test]
    async fn test_add_job_decrements_residual() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        assert!(tx.add_job(&host_id("h1"), job("j1", 512)));
        assert!(tx.add_job(&host_id("h1"), job("j2", 256)));
        let cluster = tx.commit();

        let host = cluster.host(&host_id("h1")).unwrap();
        assert_eq!(host.resources["memory"].value, 256);
        assert_eq!(host.advertised["memory"].value, 1024);
        assert_eq!(host.jobs.len(), 2);
        assert_eq!(cluster.locate(&JobId::parse("j1").unwrap()), Some(&host_id("h1")));
        check_index(&cluster).unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_resource_rejected() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        assert!(tx.add_job(&host_id("h1"), job("j1", 512)));
        let err = tx.try_add_job(&host_id("h1"), job("j2", 600)).unwrap_err();
        assert_eq!(
            err,
            RejectReason::InsufficientResource {
                resource: "memory".into(),
                requested: 600,
                available: 512
            }
        );
    }

    #[tokio::test]
    async fn test_overcommit_resource_never_rejects() {
        let host = Host::new(host_id("h1")).with_resource("cpu", ResourceValue::overcommitted(1));
        let state = state_with(host).await;
        let mut tx = state.begin().await;
        let j = Job::new(JobId::parse("j1").unwrap()).with_resource("cpu", 4);
        assert!(tx.add_job(&host_id("h1"), j));
        assert_eq!(tx.host(&host_id("h1")).unwrap().resources["cpu"].value, -3);
    }

    #[tokio::test]
    async fn test_unknown_host_and_duplicate() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        assert_eq!(
            tx.try_add_job(&host_id("nope"), job("j1", 1)),
            Err(RejectReason::UnknownHost)
        );
        assert!(tx.add_job(&host_id("h1"), job("j1", 1)));
        assert_eq!(
            tx.try_add_job(&host_id("h1"), job("j1", 1)),
            Err(RejectReason::DuplicateJob)
        );
    }

    #[tokio::test]
    async fn test_rule_rejects() {
        let host = h1().with_rule(Rule::new("env", Operator::Eq, "prod"));
        let state = state_with(host).await;
        let mut tx = state.begin().await;
        let j = job("j1", 1).with_attribute("env", "dev");
        assert!(matches!(
            tx.try_add_job(&host_id("h1"), j),
            Err(RejectReason::RuleMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_port_pool_reasons_are_distinct() {
        let host = h1().with_port_range(PortRange::new(5000, 5003).unwrap());
        let state = state_with(host).await;
        let mut tx = state.begin().await;

        let too_big = job("big", 1).with_tcp_ports(5);
        assert_eq!(
            tx.try_add_job(&host_id("h1"), too_big),
            Err(RejectReason::PortPoolTooSmall {
                requested: 5,
                pool_size: 4
            })
        );

        assert!(tx.add_job(&host_id("h1"), job("a", 1).with_tcp_ports(3)));
        assert_eq!(
            tx.try_add_job(&host_id("h1"), job("b", 1).with_tcp_ports(2)),
            Err(RejectReason::InsufficientPorts {
                requested: 2,
                available: 1
            })
        );
    }

    #[tokio::test]
    async fn test_rollback_leaves_state_untouched() {
        let state = state_with(h1()).await;
        let before = state.get().to_snapshot();

        let mut tx = state.begin().await;
        assert!(tx.add_job(&host_id("h1"), job("j1", 512)));
        let after = tx.rollback();

        assert_eq!(after.to_snapshot(), before);
        assert_eq!(state.get().to_snapshot(), before);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let state = state_with(h1()).await;
        let version = state.get().version();
        {
            let mut tx = state.begin().await;
            tx.add_job(&host_id("h1"), job("j1", 512));
        }
        assert_eq!(state.get().version(), version);
        assert_eq!(state.get().job_count(), 0);
    }

    #[tokio::test]
    async fn test_untouched_hosts_are_shared() {
        let state = ClusterState::new();
        let mut tx = state.begin().await;
        tx.add_host(h1()).unwrap();
        tx.add_host(Host::new(host_id("h2")).with_resource("memory", ResourceValue::new(64)))
            .unwrap();
        let first = tx.commit();

        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 1));
        let second = tx.commit();

        assert!(Arc::ptr_eq(
            &first.hosts[&host_id("h2")],
            &second.hosts[&host_id("h2")]
        ));
        assert!(!Arc::ptr_eq(
            &first.hosts[&host_id("h1")],
            &second.hosts[&host_id("h1")]
        ));
    }

    #[tokio::test]
    async fn test_remove_jobs_restores_and_is_idempotent() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 512));
        tx.commit();

        let ids = vec![JobId::parse("j1").unwrap(), JobId::parse("unknown").unwrap()];
        let mut tx = state.begin().await;
        assert_eq!(tx.remove_jobs(&host_id("h1"), &ids).unwrap().len(), 1);
        let cluster = tx.commit();
        assert_eq!(cluster.host(&host_id("h1")).unwrap().resources["memory"].value, 1024);

        let version = cluster.version();
        let mut tx = state.begin().await;
        assert!(tx.remove_jobs(&host_id("h1"), &ids).unwrap().is_empty());
        assert_eq!(tx.commit().version(), version);
    }

    #[tokio::test]
    async fn test_add_host_accounts_advertised_jobs() {
        let mut host = h1();
        host.jobs.push(job("running", 1000));
        let state = state_with(host).await;
        let cluster = state.get();
        assert_eq!(cluster.host(&host_id("h1")).unwrap().resources["memory"].value, 24);
        assert!(cluster.locate(&JobId::parse("running").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_add_host_rejects_overrun() {
        let mut host = h1();
        host.jobs.push(job("a", 1000));
        host.jobs.push(job("b", 1000));
        let state = ClusterState::new();
        let mut tx = state.begin().await;
        assert!(matches!(
            tx.add_host(host),
            Err(AdmissionError::ResourceOverrun { demand: 2000, .. })
        ));
    }

    #[tokio::test]
    async fn test_add_host_rejects_job_on_other_host() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 1));
        tx.commit();

        let mut h2 = Host::new(host_id("h2")).with_resource("memory", ResourceValue::new(64));
        h2.jobs.push(job("j1", 1));
        let mut tx = state.begin().await;
        assert!(matches!(
            tx.add_host(h2),
            Err(AdmissionError::JobElsewhere { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_host_frees_job_ids() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 1));
        tx.commit();

        let mut tx = state.begin().await;
        tx.remove_host(&host_id("h1"));
        let cluster = tx.commit();
        assert_eq!(cluster.host_count(), 0);
        assert_eq!(cluster.job_count(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_an_invariant_violation() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 10));
        // Corrupt the residual so the restore overshoots the advertised value.
        tx.host_mut(&host_id("h1"))
            .unwrap()
            .resources
            .get_mut("memory")
            .unwrap()
            .value = 1020;
        let err = tx.remove_jobs(&host_id("h1"), &[JobId::parse("j1").unwrap()]);
        assert!(matches!(err, Err(InvariantViolation::ResourceOverflow { .. })));
    }

    #[tokio::test]
    async fn test_negative_demand_rejected() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        assert_eq!(
            tx.try_add_job(&host_id("h1"), job("neg", -500)),
            Err(RejectReason::InvalidDemand {
                resource: "memory".into(),
                requested: -500
            })
        );
        assert_eq!(
            tx.try_add_job(&host_id("h1"), job("big", 1500)),
            Err(RejectReason::InsufficientResource {
                resource: "memory".into(),
                requested: 1500,
                available: 1024
            })
        );
        assert!(tx.add_job(&host_id("h1"), job("zero", 0)));
        assert_eq!(tx.host(&host_id("h1")).unwrap().resources["memory"].value, 1024);
    }

    #[tokio::test]
    async fn test_add_host_rejects_negative_demand() {
        let mut host = h1();
        host.jobs.push(job("neg", -1));
        let state = ClusterState::new();
        let mut tx = state.begin().await;
        assert!(matches!(
            tx.add_host(host),
            Err(AdmissionError::InvalidDemand { demand: -1, .. })
        ));
    }

    #[tokio::test]
    async fn test_add_host_rejects_repeated_job() {
        let mut host = h1();
        host.jobs.push(job("j1", 512));
        host.jobs.push(job("j1", 512));
        let state = ClusterState::new();
        let mut tx = state.begin().await;
        assert!(matches!(
            tx.add_host(host),
            Err(AdmissionError::DuplicateJob { .. })
        ));
        assert!(tx.host(&host_id("h1")).is_none());
    }

    #[tokio::test]
    async fn test_residual_below_demands_is_an_invariant_violation() {
        let state = state_with(h1()).await;
        let mut tx = state.begin().await;
        tx.add_job(&host_id("h1"), job("j1", 100));
        tx.add_job(&host_id("h1"), job("j2", 100));
        tx.host_mut(&host_id("h1"))
            .unwrap()
            .resources
            .get_mut("memory")
            .unwrap()
            .value = 0;
        let err = tx.remove_jobs(&host_id("h1"), &[JobId::parse("j1").unwrap()]);
        assert_eq!(
            err,
            Err(InvariantViolation::ResidualMismatch {
                host_id: host_id("h1"),
                resource: "memory".into(),
                residual: 100,
                expected: 924,
            })
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_commits() {
        let state = ClusterState::new();
        let mut rx = state.subscribe();
        let mut tx = state.begin().await;
        tx.add_host(h1()).unwrap();
        tx.commit();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().host_count(), 1);
    }
}
