//! Job State Table.
//!
//! Owns the Active Jobs of this host. Every transition happens under one
//! mutex and emits exactly one [`Event`]. Events are queued to listeners while
//! the lock is held, so each listener sees a job's events in transition order;
//! listeners process them on their own tasks after the lock is released.
//!
//! Two races are absorbed here rather than in callers: an exit reported while
//! the job is still starting is applied right after the running transition,
//! and a stop requested while starting is reported back on that transition.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use corral_events::{Event, EventDetails, EventKind, JobStatus};
use corral_id::{HostId, JobId};
use corral_proto::{ActiveJob, Job};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::error::StateError;

/// Outcome handed to an attach client waiting for a job to start.
pub type Handoff = Result<ActiveJob, String>;

/// Where an attach client stands when it arrives.
pub enum AttachSlot {
    /// The job is running or finished.
    Ready(ActiveJob),
    /// The job is unknown or still starting.
    Waiting(oneshot::Receiver<Handoff>),
}

/// What a stop request requires of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopAction {
    /// Stop the container now.
    Signal { container_id: String },
    /// The job is starting; the stop is applied once it runs.
    Deferred,
    /// A stop was already requested.
    AlreadyStopping,
    /// The job already finished.
    AlreadyTerminal,
}

/// Result of the starting → running transition.
#[derive(Debug, Clone)]
pub struct Started {
    pub job: ActiveJob,
    /// A stop arrived while the job was starting.
    pub stop_requested: bool,
    /// An exit arrived while the job was starting and has now been applied.
    pub finished: Option<ActiveJob>,
}

struct Entry {
    job: ActiveJob,
    events: Vec<Event>,
    pending_exit: Option<(Option<i32>, Option<i32>)>,
}

struct Listener {
    job_id: Option<JobId>,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    containers: HashMap<String, JobId>,
    attachers: HashMap<JobId, Vec<oneshot::Sender<Handoff>>>,
    listeners: Vec<Listener>,
}

pub struct JobTable {
    host_id: HostId,
    inner: Mutex<Inner>,
    fatal: watch::Sender<Option<String>>,
}

impl JobTable {
    pub fn new(host_id: HostId) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            host_id,
            inner: Mutex::new(Inner::default()),
            fatal,
        }
    }

    pub fn host_id(&self) -> &HostId {
        &self.host_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports broken invariants; the agent exits once this fires.
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    fn violation(&self, err: StateError) -> StateError {
        let dump = serde_json::to_string(&self.list())
            .unwrap_or_else(|e| format!("<unserializable: {e}>"));
        error!(host_id = %self.host_id, violation = %err, state = %dump, "Job state invariant violated");
        self.fatal.send_replace(Some(err.to_string()));
        err
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Records a job received from the scheduler. A finished record with the
    /// same id is replaced; an active one is an invariant violation.
    pub fn add_job(&self, job: Job) -> Result<ActiveJob, StateError> {
        let mut guard = self.lock();
        if guard.jobs.get(&job.id).is_some_and(|e| !e.job.is_terminal()) {
            drop(guard);
            return Err(self.violation(StateError::Duplicate(job.id)));
        }

        let Inner { jobs, containers, listeners, .. } = &mut *guard;
        if let Some(old) = jobs.remove(&job.id) {
            if let Some(cid) = &old.job.container_id {
                containers.remove(cid);
            }
        }

        let mut entry = Entry {
            job: ActiveJob::new(job, self.host_id.clone()),
            events: Vec::new(),
            pending_exit: None,
        };
        emit(listeners, &self.host_id, &mut entry, EventKind::Create, None);
        let active = entry.job.clone();
        jobs.insert(active.job.id.clone(), entry);

        info!(job_id = %active.job.id, "Job added");
        Ok(active)
    }

    pub fn set_container_id(&self, job_id: &JobId, container_id: &str) -> Result<(), StateError> {
        let mut guard = self.lock();
        let Inner { jobs, containers, .. } = &mut *guard;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;
        entry.job.container_id = Some(container_id.to_string());
        containers.insert(container_id.to_string(), job_id.clone());
        Ok(())
    }

    pub fn set_ports(&self, job_id: &JobId, ports: Vec<u16>) -> Result<(), StateError> {
        let mut guard = self.lock();
        let entry = guard
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;
        entry.job.allocated_ports = ports;
        Ok(())
    }

    /// starting → running. Hands the job to waiting attach clients and
    /// applies an exit that arrived early.
    pub fn set_running(&self, job_id: &JobId) -> Result<Started, StateError> {
        let mut guard = self.lock();
        let Inner { jobs, attachers, listeners, .. } = &mut *guard;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;

        if entry.job.status != JobStatus::Starting {
            let err = StateError::InvalidTransition {
                job_id: job_id.clone(),
                from: entry.job.status,
                to: JobStatus::Running,
            };
            drop(guard);
            return Err(self.violation(err));
        }

        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        emit(listeners, &self.host_id, entry, EventKind::Start, None);
        let running = entry.job.clone();

        let finished = match entry.pending_exit.take() {
            Some((code, signal)) => {
                apply_exit(listeners, &self.host_id, entry, code, signal);
                Some(entry.job.clone())
            }
            None => None,
        };
        let stop_requested = finished.is_none() && entry.job.stop_requested;
        let waiters = attachers.remove(job_id).unwrap_or_default();
        drop(guard);

        debug!(job_id = %job_id, waiters = waiters.len(), "Job running");
        for waiter in waiters {
            let _ = waiter.send(Ok(running.clone()));
        }
        Ok(Started {
            job: running,
            stop_requested,
            finished,
        })
    }

    /// Records a process exit. Returns the job if this made it terminal.
    pub fn set_exited(
        &self,
        job_id: &JobId,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> Result<Option<ActiveJob>, StateError> {
        let mut guard = self.lock();
        let Inner { jobs, listeners, .. } = &mut *guard;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;

        match entry.job.status {
            JobStatus::Starting => {
                debug!(job_id = %job_id, ?exit_code, ?signal, "Exit before start, deferring");
                entry.pending_exit = Some((exit_code, signal));
                Ok(None)
            }
            JobStatus::Running => {
                apply_exit(listeners, &self.host_id, entry, exit_code, signal);
                info!(job_id = %job_id, status = %entry.job.status, ?exit_code, ?signal, "Job exited");
                Ok(Some(entry.job.clone()))
            }
            _ => Ok(None),
        }
    }

    /// starting → failed. Waiting attach clients receive the error.
    pub fn set_failed(&self, job_id: &JobId, reason: &str) -> Result<Option<ActiveJob>, StateError> {
        let mut guard = self.lock();
        let Inner { jobs, attachers, listeners, .. } = &mut *guard;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;

        match entry.job.status {
            JobStatus::Starting => {}
            status if status.is_terminal() => return Ok(None),
            status => {
                let err = StateError::InvalidTransition {
                    job_id: job_id.clone(),
                    from: status,
                    to: JobStatus::Failed,
                };
                drop(guard);
                return Err(self.violation(err));
            }
        }

        entry.job.status = JobStatus::Failed;
        entry.job.ended_at = Some(Utc::now());
        entry.job.error = Some(reason.to_string());
        entry.job.stop_requested = false;
        let details = EventDetails {
            error: Some(reason.to_string()),
            ..Default::default()
        };
        emit(listeners, &self.host_id, entry, EventKind::Error, Some(details));
        let failed = entry.job.clone();
        let waiters = attachers.remove(job_id).unwrap_or_default();
        drop(guard);

        info!(job_id = %job_id, error = reason, "Job failed");
        for waiter in waiters {
            let _ = waiter.send(Err(reason.to_string()));
        }
        Ok(Some(failed))
    }

    /// Marks a job as stopping. The status stays `running` until the exit is
    /// reported.
    pub fn request_stop(&self, job_id: &JobId) -> Result<StopAction, StateError> {
        let mut guard = self.lock();
        let entry = guard
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;

        if entry.job.is_terminal() {
            return Ok(StopAction::AlreadyTerminal);
        }
        if entry.job.stop_requested {
            return Ok(StopAction::AlreadyStopping);
        }
        entry.job.stop_requested = true;

        match (&entry.job.status, &entry.job.container_id) {
            (JobStatus::Running, Some(cid)) => Ok(StopAction::Signal {
                container_id: cid.clone(),
            }),
            _ => Ok(StopAction::Deferred),
        }
    }

    // -------------------------------------------------------------------------
    // Attach wait list
    // -------------------------------------------------------------------------

    pub fn add_attacher(&self, job_id: &JobId) -> AttachSlot {
        let mut guard = self.lock();
        if let Some(entry) = guard.jobs.get(job_id) {
            if entry.job.status != JobStatus::Starting {
                return AttachSlot::Ready(entry.job.clone());
            }
        }

        let (tx, rx) = oneshot::channel();
        let waiters = guard.attachers.entry(job_id.clone()).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        AttachSlot::Waiting(rx)
    }

    /// Drops waiters for `job_id` whose client has gone away.
    pub fn release_attachers(&self, job_id: &JobId) {
        let mut guard = self.lock();
        if let Some(waiters) = guard.attachers.get_mut(job_id) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                guard.attachers.remove(job_id);
            }
        }
    }

    /// Number of job ids with a wait list.
    pub fn attach_wait_lists(&self) -> usize {
        self.lock().attachers.len()
    }

    /// Number of attach clients waiting for `job_id`.
    pub fn waiting_attachers(&self, job_id: &JobId) -> usize {
        self.lock()
            .attachers
            .get(job_id)
            .map_or(0, |w| w.iter().filter(|w| !w.is_closed()).count())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get(&self, job_id: &JobId) -> Option<ActiveJob> {
        self.lock().jobs.get(job_id).map(|e| e.job.clone())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self.lock().jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });
        jobs
    }

    /// Jobs that are not yet terminal, as advertised to the scheduler.
    pub fn active_jobs(&self) -> Vec<Job> {
        self.list()
            .into_iter()
            .filter(|j| !j.is_terminal())
            .map(|j| j.job)
            .collect()
    }

    pub fn job_for_container(&self, container_id: &str) -> Option<JobId> {
        self.lock().containers.get(container_id).cloned()
    }

    /// Events emitted so far for one job.
    pub fn events(&self, job_id: &JobId) -> Option<Vec<Event>> {
        self.lock().jobs.get(job_id).map(|e| e.events.clone())
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Receives every event from now on, optionally for one job only.
    pub fn subscribe(&self, job_id: Option<JobId>) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.push(Listener { job_id, tx });
        rx
    }

    /// The events a job has emitted so far and a subscription to the rest,
    /// taken atomically.
    pub fn subscribe_job(
        &self,
        job_id: &JobId,
    ) -> Result<(Vec<Event>, mpsc::UnboundedReceiver<Event>), StateError> {
        let mut guard = self.lock();
        let history = guard
            .jobs
            .get(job_id)
            .map(|e| e.events.clone())
            .ok_or_else(|| StateError::NotFound(job_id.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        guard.listeners.push(Listener {
            job_id: Some(job_id.clone()),
            tx,
        });
        Ok((history, rx))
    }

    // -------------------------------------------------------------------------
    // Pruning
    // -------------------------------------------------------------------------

    /// Drops terminal jobs that ended at least `retention` before `now` and
    /// returns their final records.
    pub fn prune_terminal(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<ActiveJob> {
        let mut guard = self.lock();
        let Inner {
            jobs,
            containers,
            attachers,
            ..
        } = &mut *guard;

        attachers.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });

        let expired: Vec<JobId> = jobs
            .values()
            .filter(|e| e.job.is_terminal())
            .filter(|e| e.job.ended_at.is_some_and(|t| t + retention <= now))
            .map(|e| e.job.job.id.clone())
            .collect();
        let mut pruned = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(entry) = jobs.remove(id) {
                if let Some(cid) = &entry.job.container_id {
                    containers.remove(cid);
                }
                pruned.push(entry.job);
            }
        }
        pruned
    }
}

fn emit(
    listeners: &mut Vec<Listener>,
    host_id: &HostId,
    entry: &mut Entry,
    kind: EventKind,
    details: Option<EventDetails>,
) {
    let mut event = Event::new(kind, entry.job.job.id.clone(), host_id.clone());
    event.details = details;
    entry.events.push(event.clone());
    listeners.retain(|l| {
        if l.job_id.as_ref().is_some_and(|id| *id != event.job_id) {
            return !l.tx.is_closed();
        }
        l.tx.send(event.clone()).is_ok()
    });
}

fn apply_exit(
    listeners: &mut Vec<Listener>,
    host_id: &HostId,
    entry: &mut Entry,
    exit_code: Option<i32>,
    signal: Option<i32>,
) {
    let details = EventDetails {
        exit_code,
        signal,
        error: None,
    };
    let status = EventKind::Stop.resulting_status(Some(&details));

    let job = &mut entry.job;
    job.status = status;
    job.exit_code = exit_code;
    job.signal = signal;
    job.ended_at = Some(Utc::now());
    job.stop_requested = false;
    if status == JobStatus::Crashed {
        job.error = Some(match (signal, exit_code) {
            (Some(sig), _) => format!("killed by signal {sig}"),
            (None, Some(code)) => format!("exited with code {code}"),
            (None, None) => "exited without a status".to_string(),
        });
    }
    emit(listeners, host_id, entry, EventKind::Stop, Some(details));
}
