//! Scheduling operations on top of the cluster state and host channels.

use std::sync::Arc;
use std::time::Duration;

use corral_id::{HostId, JobId};
use corral_proto::{Host, Job, RejectReason, Rejection, ScheduleRequest, ScheduleResponse};
use corral_registry::LeaderState;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::channels::{HostChannels, SendError};
use crate::cluster::{Cluster, ClusterState};
use crate::error::{AdmissionError, InvariantViolation, SchedulerError};

/// Tunables for scheduling and host channels.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Bound on a single host channel send or reservation.
    pub send_timeout: Duration,

    /// Jobs that may be queued for a host before sends start waiting.
    pub channel_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(2000),
            channel_capacity: 1024,
        }
    }
}

/// An admitted host's side of its registration.
pub struct HostRegistration {
    pub host_id: HostId,
    pub generation: u64,
    pub jobs: mpsc::Receiver<Job>,
}

pub struct Scheduler {
    cluster: ClusterState,
    channels: HostChannels,
    options: SchedulerOptions,
    registry: Option<watch::Receiver<LeaderState>>,
    fatal: watch::Sender<Option<InvariantViolation>>,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            cluster: ClusterState::new(),
            channels: HostChannels::new(),
            options,
            registry: None,
            fatal,
        }
    }

    /// Refuses host registrations while `registry` reports the registry as
    /// unreachable.
    pub fn with_registry_gate(mut self, registry: watch::Receiver<LeaderState>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn state(&self) -> Arc<Cluster> {
        self.cluster.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Cluster>> {
        self.cluster.subscribe()
    }

    /// Resolves once an invariant violation has been reported.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<InvariantViolation>> {
        self.fatal.subscribe()
    }

    /// Places the requested jobs.
    ///
    /// Atomic requests commit all jobs or none; incremental requests commit
    /// whatever fits and return the rest in `remaining`.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleResponse, SchedulerError> {
        if request.incremental {
            self.schedule_incremental(request).await
        } else {
            Ok(self.schedule_atomic(request).await)
        }
    }

    async fn schedule_atomic(&self, request: ScheduleRequest) -> ScheduleResponse {
        let mut tx = self.cluster.begin().await;

        let mut accepted = Vec::with_capacity(request.host_jobs.job_count());
        for (host_id, job) in request.host_jobs.iter() {
            if let Err(reason) = tx.try_add_job(host_id, job.clone()) {
                let state = tx.rollback();
                debug!(host_id = %host_id, job_id = %job.id, reason = %reason, "Atomic schedule rolled back");
                return rejected(&state, host_id, &job.id, reason);
            }
            accepted.push((host_id.clone(), job.clone()));
        }

        // Every job needs a channel slot before anything becomes visible.
        let mut permits = Vec::with_capacity(accepted.len());
        for (host_id, job) in &accepted {
            match self.channels.reserve(host_id, self.options.send_timeout).await {
                Ok(permit) => permits.push(permit),
                Err(e) => {
                    let state = tx.rollback();
                    warn!(host_id = %host_id, job_id = %job.id, error = %e, "Atomic schedule rolled back");
                    return rejected(&state, host_id, &job.id, send_reason(&e));
                }
            }
        }

        let state = tx.commit();
        for (permit, (_, job)) in permits.into_iter().zip(accepted) {
            permit.send(job);
        }

        ScheduleResponse {
            success: true,
            state: state.to_snapshot(),
            remaining: Vec::new(),
            rejections: Vec::new(),
        }
    }

    async fn schedule_incremental(&self, request: ScheduleRequest) -> Result<ScheduleResponse, SchedulerError> {
        let mut tx = self.cluster.begin().await;
        let mut remaining = Vec::new();
        let mut rejections = Vec::new();

        for (host_id, job) in request.host_jobs.iter() {
            let reason = match tx.try_add_job(host_id, job.clone()) {
                Err(reason) => reason,
                Ok(()) => match self
                    .channels
                    .send(host_id, job.clone(), self.options.send_timeout)
                    .await
                {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!(host_id = %host_id, job_id = %job.id, error = %e, "Host channel send failed");
                        tx.remove_jobs(host_id, std::slice::from_ref(&job.id))
                            .map_err(|v| self.fatal(v))?;
                        send_reason(&e)
                    }
                },
            };
            remaining.push(job.clone());
            rejections.push(Rejection {
                job_id: job.id.clone(),
                host_id: host_id.clone(),
                reason,
            });
        }

        let state = tx.commit();
        debug!(
            accepted = request.host_jobs.job_count() - remaining.len(),
            remaining = remaining.len(),
            "Incremental schedule committed"
        );
        Ok(ScheduleResponse {
            success: true,
            state: state.to_snapshot(),
            remaining,
            rejections,
        })
    }

    /// Admits a host and binds a fresh outbound channel to it.
    pub async fn register_host(&self, host: Host) -> Result<HostRegistration, AdmissionError> {
        if let Some(registry) = &self.registry {
            if !registry.borrow().available {
                return Err(AdmissionError::RegistryUnavailable);
            }
        }

        let host_id = host.id.clone();
        let (sender, jobs) = mpsc::channel(self.options.channel_capacity);
        let generation = self
            .channels
            .try_bind(&host_id, sender)
            .ok_or_else(|| AdmissionError::DuplicateRegistration(host_id.clone()))?;

        let mut tx = self.cluster.begin().await;
        let job_count = host.jobs.len();
        if let Err(e) = tx.add_host(host) {
            drop(tx);
            self.channels.unbind(&host_id, generation);
            return Err(e);
        }
        tx.commit();

        info!(host_id = %host_id, jobs = job_count, "Host registered");
        Ok(HostRegistration {
            host_id,
            generation,
            jobs,
        })
    }

    /// Removes a host whose registration stream ended.
    pub async fn deregister(&self, host_id: &HostId, generation: u64) {
        let mut tx = self.cluster.begin().await;
        let removed = tx.remove_host(host_id);
        tx.commit();
        self.channels.unbind(host_id, generation);

        if let Some(host) = removed {
            info!(host_id = %host_id, jobs = host.jobs.len(), "Host deregistered");
        }
    }

    /// Drops terminal jobs from a host and restores their resources.
    pub async fn remove_jobs(&self, host_id: &HostId, job_ids: &[JobId]) -> Result<(), SchedulerError> {
        let mut tx = self.cluster.begin().await;
        let removed = tx.remove_jobs(host_id, job_ids).map_err(|v| self.fatal(v))?;
        tx.commit();
        if !removed.is_empty() {
            debug!(host_id = %host_id, removed = removed.len(), "Jobs removed");
        }
        Ok(())
    }

    /// Records an invariant violation with a dump of the committed state.
    fn fatal(&self, violation: InvariantViolation) -> SchedulerError {
        let dump = serde_json::to_string(&self.cluster.get().to_snapshot())
            .unwrap_or_else(|e| format!("<unserializable: {e}>"));
        error!(violation = %violation, state = %dump, "Cluster state invariant violated");
        self.fatal.send_replace(Some(violation.clone()));
        SchedulerError::Invariant(violation)
    }
}

fn send_reason(err: &SendError) -> RejectReason {
    match err {
        SendError::NotConnected(_) => RejectReason::UnknownHost,
        SendError::Stalled(_) => RejectReason::HostStalled,
    }
}

fn rejected(state: &Cluster, host_id: &HostId, job_id: &JobId, reason: RejectReason) -> ScheduleResponse {
    ScheduleResponse {
        success: false,
        state: state.to_snapshot(),
        remaining: Vec::new(),
        rejections: vec![Rejection {
            job_id: job_id.clone(),
            host_id: host_id.clone(),
            reason,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_proto::{HostJobs, Operator, ResourceValue, Rule};

    fn hid(s: &str) -> HostId {
        HostId::parse(s).unwrap()
    }

    fn job(id: &str, memory: i64) -> Job {
        Job::new(JobId::parse(id).unwrap()).with_resource("memory", memory)
    }

    fn h1() -> Host {
        Host::new(hid("h1")).with_resource("memory", ResourceValue::new(1024))
    }

    fn options(capacity: usize) -> SchedulerOptions {
        SchedulerOptions {
            send_timeout: Duration::from_millis(50),
            channel_capacity: capacity,
        }
    }

    async fn with_h1() -> (Scheduler, HostRegistration) {
        let scheduler = Scheduler::new(options(16));
        let reg = scheduler.register_host(h1()).await.unwrap();
        (scheduler, reg)
    }

    fn ids(jobs: &[Job]) -> Vec<&str> {
        jobs.iter().map(|j| j.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_atomic_happy_path() {
        let (scheduler, mut reg) = with_h1().await;
        let request = ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512), job("j2", 256)]),
        );

        let resp = scheduler.schedule(request).await.unwrap();
        assert!(resp.success);
        assert!(resp.remaining.is_empty());
        assert_eq!(resp.state.hosts[&hid("h1")].resources["memory"].value, 256);
        assert_eq!(reg.jobs.recv().await.unwrap().id.as_str(), "j1");
        assert_eq!(reg.jobs.recv().await.unwrap().id.as_str(), "j2");
    }

    #[tokio::test]
    async fn test_atomic_rollback_is_byte_identical() {
        let (scheduler, mut reg) = with_h1().await;
        let before = serde_json::to_vec(&scheduler.state().to_snapshot()).unwrap();

        let request = ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512), job("j2", 600)]),
        );
        let resp = scheduler.schedule(request).await.unwrap();

        assert!(!resp.success);
        assert!(resp.remaining.is_empty());
        assert_eq!(resp.rejections[0].job_id.as_str(), "j2");
        assert_eq!(serde_json::to_vec(&scheduler.state().to_snapshot()).unwrap(), before);
        assert!(reg.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incremental_partial() {
        let (scheduler, mut reg) = with_h1().await;
        let request = ScheduleRequest::incremental(HostJobs::new().with(
            hid("h1"),
            vec![job("j1", 512), job("j2", 600), job("j3", 256)],
        ));

        let resp = scheduler.schedule(request).await.unwrap();
        assert!(resp.success);
        assert_eq!(ids(&resp.remaining), vec!["j2"]);
        assert_eq!(resp.state.hosts[&hid("h1")].resources["memory"].value, 256);
        assert_eq!(reg.jobs.recv().await.unwrap().id.as_str(), "j1");
        assert_eq!(reg.jobs.recv().await.unwrap().id.as_str(), "j3");
    }

    #[tokio::test]
    async fn test_incremental_unknown_host_and_duplicate() {
        let (scheduler, _reg) = with_h1().await;
        let request = ScheduleRequest::incremental(
            HostJobs::new()
                .with(hid("h1"), vec![job("j1", 1), job("j1", 1)])
                .with(hid("ghost"), vec![job("j2", 1)]),
        );

        let resp = scheduler.schedule(request).await.unwrap();
        assert_eq!(ids(&resp.remaining), vec!["j1", "j2"]);
        assert_eq!(resp.rejections[0].reason, RejectReason::DuplicateJob);
        assert_eq!(resp.rejections[1].reason, RejectReason::UnknownHost);
        assert_eq!(resp.state.job_count(), 1);
    }

    #[tokio::test]
    async fn test_rule_filter() {
        let scheduler = Scheduler::new(options(4));
        let host = h1().with_rule(Rule::new("env", Operator::Eq, "prod"));
        let _reg = scheduler.register_host(host).await.unwrap();

        let request = ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 1).with_attribute("env", "dev")]),
        );
        let resp = scheduler.schedule(request).await.unwrap();
        assert!(!resp.success);
        assert!(matches!(
            resp.rejections[0].reason,
            RejectReason::RuleMismatch { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_stalled_host_rolls_back() {
        let scheduler = Scheduler::new(options(1));
        let _reg = scheduler.register_host(h1()).await.unwrap();

        let request = ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 1), job("j2", 1)]),
        );
        let resp = scheduler.schedule(request).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.rejections[0].reason, RejectReason::HostStalled);
        assert_eq!(scheduler.state().job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_stalled_host_reports_remaining() {
        let scheduler = Scheduler::new(options(1));
        let _reg = scheduler.register_host(h1()).await.unwrap();

        let request = ScheduleRequest::incremental(
            HostJobs::new().with(hid("h1"), vec![job("j1", 100), job("j2", 100)]),
        );
        let resp = scheduler.schedule(request).await.unwrap();
        assert!(resp.success);
        assert_eq!(ids(&resp.remaining), vec!["j2"]);
        assert_eq!(resp.rejections[0].reason, RejectReason::HostStalled);
        assert_eq!(resp.state.hosts[&hid("h1")].resources["memory"].value, 924);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (scheduler, reg) = with_h1().await;
        let err = scheduler.register_host(h1()).await.err();
        assert_eq!(err, Some(AdmissionError::DuplicateRegistration(hid("h1"))));

        scheduler.deregister(&reg.host_id, reg.generation).await;
        assert!(scheduler.register_host(h1()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reregistration_restores_advertised_jobs() {
        let (scheduler, reg) = with_h1().await;
        let request = ScheduleRequest::atomic(
            HostJobs::new().with(hid("h1"), vec![job("j1", 512), job("j2", 256)]),
        );
        scheduler.schedule(request).await.unwrap();
        scheduler.deregister(&reg.host_id, reg.generation).await;
        assert_eq!(scheduler.state().host_count(), 0);

        let mut advertised = h1();
        advertised.jobs.push(job("j1", 512));
        let _reg = scheduler.register_host(advertised.clone()).await.unwrap();

        let state = scheduler.state();
        let host = state.host(&hid("h1")).unwrap();
        assert_eq!(host.jobs, advertised.jobs);
        assert_eq!(host.resources["memory"].value, 512);
        assert_eq!(host.advertised, advertised.resources);
    }

    #[tokio::test]
    async fn test_remove_jobs_restores_resources() {
        let (scheduler, _reg) = with_h1().await;
        let request = ScheduleRequest::atomic(HostJobs::new().with(hid("h1"), vec![job("j1", 512)]));
        scheduler.schedule(request).await.unwrap();

        let ids = vec![JobId::parse("j1").unwrap()];
        scheduler.remove_jobs(&hid("h1"), &ids).await.unwrap();
        scheduler.remove_jobs(&hid("h1"), &ids).await.unwrap();

        let state = scheduler.state();
        assert_eq!(state.host(&hid("h1")).unwrap().resources["memory"].value, 1024);
        assert!(state.host(&hid("h1")).unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_registry_gate_refuses_registration() {
        let (gate_tx, gate_rx) = watch::channel(LeaderState::default());
        let scheduler = Scheduler::new(options(4)).with_registry_gate(gate_rx);
        assert_eq!(
            scheduler.register_host(h1()).await.err(),
            Some(AdmissionError::RegistryUnavailable)
        );

        gate_tx.send_modify(|s| s.available = true);
        assert!(scheduler.register_host(h1()).await.is_ok());
    }
}
