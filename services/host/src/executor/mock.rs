//! Scriptable executor for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_id::JobId;
use corral_proto::attach::StreamId;
use corral_proto::Job;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    container_env, AttachOptions, AttachStreams, ContainerEvent, ContainerStatus, EventFanout,
    Executor, OutputHub,
};
use crate::error::ExecutorError;

/// How a mock container behaves.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub prepare_error: Option<String>,
    pub create_error: Option<String>,
    pub start_error: Option<String>,
    pub start_delay: Duration,
    /// Written to the output right after start.
    pub output: Vec<(StreamId, Bytes)>,
    /// `(exit_code, signal)` the process exits with on its own.
    pub exit: Option<(Option<i32>, Option<i32>)>,
    pub exit_after: Duration,
    /// Only SIGKILL ends the process.
    pub ignore_term: bool,
    /// Copies stdin to stdout.
    pub echo_stdin: bool,
}

impl MockBehavior {
    /// Runs until stopped.
    pub fn long_running() -> Self {
        Self::default()
    }

    pub fn exits_with(code: i32) -> Self {
        Self {
            exit: Some((Some(code), None)),
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.exit_after = delay;
        self
    }

    pub fn prints(mut self, stream: StreamId, data: &'static [u8]) -> Self {
        self.output.push((stream, Bytes::from_static(data)));
        self
    }

    pub fn fails_prepare(reason: &str) -> Self {
        Self {
            prepare_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn fails_start(reason: &str) -> Self {
        Self {
            start_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn slow_start(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn ignoring_term(mut self) -> Self {
        self.ignore_term = true;
        self
    }

    pub fn echoing(mut self) -> Self {
        self.echo_stdin = true;
        self
    }
}

struct MockContainer {
    job_id: JobId,
    tty: bool,
    env: BTreeMap<String, String>,
    hub: Arc<OutputHub>,
    behavior: MockBehavior,
    stdin: Vec<u8>,
    stdin_closed: bool,
    signals: Vec<i32>,
    sizes: Vec<(u16, u16)>,
    started: bool,
    exited: bool,
    removed: bool,
}

#[derive(Default)]
struct MockState {
    behaviors: Mutex<HashMap<JobId, MockBehavior>>,
    default: Mutex<MockBehavior>,
    containers: Mutex<HashMap<String, MockContainer>>,
    events: EventFanout,
    next_id: AtomicU64,
}

impl MockState {
    fn containers(&self) -> MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn behavior(&self, job_id: &JobId) -> MockBehavior {
        self.behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| {
                self.default
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }

    fn die(&self, container_id: &str, exit_code: Option<i32>, signal: Option<i32>) -> bool {
        {
            let mut containers = self.containers();
            let Some(container) = containers.get_mut(container_id) else {
                return false;
            };
            if container.exited || !container.started {
                return false;
            }
            container.exited = true;
            container.hub.close();
        }
        debug!(container_id, ?exit_code, ?signal, "Mock container exited");
        self.events.publish(ContainerEvent {
            container_id: container_id.to_string(),
            status: ContainerStatus::Die { exit_code, signal },
        });
        true
    }

    fn container_for(&self, job_id: &JobId) -> Option<String> {
        self.containers()
            .iter()
            .filter(|(_, c)| &c.job_id == job_id)
            .map(|(id, _)| id.clone())
            .max()
    }
}

/// In-memory [`Executor`] whose containers follow a [`MockBehavior`].
#[derive(Clone, Default)]
pub struct MockExecutor {
    state: Arc<MockState>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for one job id.
    pub fn script(&self, job_id: &JobId, behavior: MockBehavior) {
        self.state
            .behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), behavior);
    }

    /// Behavior for jobs without a script.
    pub fn set_default(&self, behavior: MockBehavior) {
        *self
            .state
            .default
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Ends the latest container of `job_id`.
    pub fn exit(&self, job_id: &JobId, exit_code: Option<i32>, signal: Option<i32>) -> bool {
        match self.state.container_for(job_id) {
            Some(cid) => self.state.die(&cid, exit_code, signal),
            None => false,
        }
    }

    pub fn write(&self, job_id: &JobId, stream: StreamId, data: &[u8]) -> bool {
        let Some(cid) = self.state.container_for(job_id) else {
            return false;
        };
        let containers = self.state.containers();
        match containers.get(&cid) {
            Some(c) if c.started && !c.exited => {
                c.hub.push(stream, Bytes::copy_from_slice(data));
                true
            }
            _ => false,
        }
    }

    fn inspect<T>(&self, job_id: &JobId, f: impl FnOnce(&MockContainer) -> T) -> Option<T> {
        let cid = self.state.container_for(job_id)?;
        self.state.containers().get(&cid).map(f)
    }

    pub fn container_id(&self, job_id: &JobId) -> Option<String> {
        self.state.container_for(job_id)
    }

    pub fn signals(&self, job_id: &JobId) -> Vec<i32> {
        self.inspect(job_id, |c| c.signals.clone()).unwrap_or_default()
    }

    pub fn stdin(&self, job_id: &JobId) -> Vec<u8> {
        self.inspect(job_id, |c| c.stdin.clone()).unwrap_or_default()
    }

    pub fn stdin_closed(&self, job_id: &JobId) -> bool {
        self.inspect(job_id, |c| c.stdin_closed).unwrap_or(false)
    }

    pub fn sizes(&self, job_id: &JobId) -> Vec<(u16, u16)> {
        self.inspect(job_id, |c| c.sizes.clone()).unwrap_or_default()
    }

    pub fn env(&self, job_id: &JobId) -> Option<BTreeMap<String, String>> {
        self.inspect(job_id, |c| c.env.clone())
    }

    pub fn is_removed(&self, job_id: &JobId) -> bool {
        self.inspect(job_id, |c| c.removed).unwrap_or(false)
    }

    fn kill_later(&self, container_id: String, grace: Duration) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let alive = state
                .containers()
                .get_mut(&container_id)
                .map(|c| {
                    if !c.exited {
                        c.signals.push(libc::SIGKILL);
                    }
                    !c.exited
                })
                .unwrap_or(false);
            if alive {
                state.die(&container_id, None, Some(libc::SIGKILL));
            }
        });
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn prepare(&self, job: &Job) -> Result<(), ExecutorError> {
        match self.state.behavior(&job.id).prepare_error {
            Some(reason) => Err(ExecutorError::ImageUnavailable(reason)),
            None => Ok(()),
        }
    }

    async fn create(&self, job: &Job, ports: &[u16]) -> Result<String, ExecutorError> {
        let behavior = self.state.behavior(&job.id);
        if let Some(reason) = &behavior.create_error {
            return Err(ExecutorError::Create(reason.clone()));
        }
        let n = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let container_id = format!("mock-{n:06}");
        self.state.containers().insert(
            container_id.clone(),
            MockContainer {
                job_id: job.id.clone(),
                tty: job.tty,
                env: container_env(job, ports),
                hub: Arc::new(OutputHub::new()),
                behavior,
                stdin: Vec::new(),
                stdin_closed: false,
                signals: Vec::new(),
                sizes: Vec::new(),
                started: false,
                exited: false,
                removed: false,
            },
        );
        Ok(container_id)
    }

    async fn start(&self, container_id: &str) -> Result<(), ExecutorError> {
        let behavior = self
            .state
            .containers()
            .get(container_id)
            .map(|c| c.behavior.clone())
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))?;

        if !behavior.start_delay.is_zero() {
            tokio::time::sleep(behavior.start_delay).await;
        }
        if let Some(reason) = behavior.start_error {
            return Err(ExecutorError::Start(reason));
        }

        if let Some(c) = self.state.containers().get_mut(container_id) {
            c.started = true;
            for (stream, data) in &behavior.output {
                c.hub.push(*stream, data.clone());
            }
        }
        self.state.events.publish(ContainerEvent {
            container_id: container_id.to_string(),
            status: ContainerStatus::Start,
        });

        if let Some((code, signal)) = behavior.exit {
            let state = Arc::clone(&self.state);
            let cid = container_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(behavior.exit_after).await;
                state.die(&cid, code, signal);
            });
        }
        Ok(())
    }

    async fn attach(
        &self,
        container_id: &str,
        options: AttachOptions,
    ) -> Result<AttachStreams, ExecutorError> {
        let (hub, echo) = self
            .state
            .containers()
            .get(container_id)
            .map(|c| (Arc::clone(&c.hub), c.behavior.echo_stdin))
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))?;

        let output = hub.attach(options);
        let stdin = options.stdin.then(|| {
            let (tx, mut rx) = mpsc::channel::<Bytes>(16);
            let state = Arc::clone(&self.state);
            let cid = container_id.to_string();
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    let mut containers = state.containers();
                    let Some(c) = containers.get_mut(&cid) else {
                        return;
                    };
                    if data.is_empty() {
                        c.stdin_closed = true;
                        return;
                    }
                    c.stdin.extend_from_slice(&data);
                    if echo {
                        c.hub.push(StreamId::Stdout, data);
                    }
                }
            });
            tx
        });
        Ok(AttachStreams { output, stdin })
    }

    async fn resize(&self, container_id: &str, cols: u16, rows: u16) -> Result<(), ExecutorError> {
        let mut containers = self.state.containers();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))?;
        if c.tty {
            c.sizes.push((cols, rows));
        }
        Ok(())
    }

    async fn signal(&self, container_id: &str, signal: i32) -> Result<(), ExecutorError> {
        let ends = {
            let mut containers = self.state.containers();
            let c = containers
                .get_mut(container_id)
                .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))?;
            if c.exited {
                return Err(ExecutorError::Signal(format!(
                    "container {container_id} has exited"
                )));
            }
            c.signals.push(signal);
            signal == libc::SIGKILL || (signal == libc::SIGTERM && !c.behavior.ignore_term)
        };
        if ends {
            self.state.die(container_id, None, Some(signal));
        }
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ExecutorError> {
        self.signal(container_id, libc::SIGTERM).await?;
        self.kill_later(container_id.to_string(), grace);
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), ExecutorError> {
        let mut containers = self.state.containers();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| ExecutorError::ContainerNotFound(container_id.to_string()))?;
        c.removed = true;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ContainerEvent> {
        self.state.events.subscribe()
    }
}
