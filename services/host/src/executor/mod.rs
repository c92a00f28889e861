//! Container executors.
//!
//! An [`Executor`] turns a [`Job`] into a running process and reports its
//! exit. The host agent only talks to this trait; [`ProcessExecutor`] runs
//! jobs as local processes and [`MockExecutor`] scripts their behavior for
//! tests.

mod mock;
mod output;
mod process;

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use corral_proto::attach::StreamId;
use corral_proto::Job;
use tokio::sync::mpsc;

use crate::error::ExecutorError;

pub use mock::{MockBehavior, MockExecutor};
pub use output::{OutputChunk, OutputHub, HISTORY_LIMIT};
pub use process::ProcessExecutor;

/// What an attach connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Replay buffered output first.
    pub logs: bool,
    /// Follow live output until the process exits.
    pub stream: bool,
    /// Initial terminal size `(cols, rows)`.
    pub size: Option<(u16, u16)>,
}

impl AttachOptions {
    pub fn wants(&self, stream: StreamId) -> bool {
        match stream {
            StreamId::Stdin => self.stdin,
            StreamId::Stdout => self.stdout,
            StreamId::Stderr => self.stderr,
        }
    }
}

/// The I/O handles of one attach.
#[derive(Debug)]
pub struct AttachStreams {
    /// Output in emission order. Closes when the process exits or, without
    /// `stream`, once the replay is done.
    pub output: mpsc::Receiver<OutputChunk>,
    /// Sends bytes to the process's stdin. An empty chunk closes stdin.
    pub stdin: Option<mpsc::Sender<Bytes>>,
}

/// A lifecycle change of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Start,
    Die {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub status: ContainerStatus,
}

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Makes the job's image available locally.
    async fn prepare(&self, job: &Job) -> Result<(), ExecutorError>;

    /// Creates a container for `job` with its allocated ports. Returns the
    /// container id.
    async fn create(&self, job: &Job, ports: &[u16]) -> Result<String, ExecutorError>;

    /// Starts a created container; returns once its main process is live.
    async fn start(&self, container_id: &str) -> Result<(), ExecutorError>;

    async fn attach(
        &self,
        container_id: &str,
        options: AttachOptions,
    ) -> Result<AttachStreams, ExecutorError>;

    /// Resizes the container's terminal. A no-op for non-TTY containers.
    async fn resize(&self, container_id: &str, cols: u16, rows: u16) -> Result<(), ExecutorError>;

    async fn signal(&self, container_id: &str, signal: i32) -> Result<(), ExecutorError>;

    /// Sends SIGTERM and SIGKILL after `grace`. Returns without waiting for
    /// the exit, which arrives as a [`ContainerStatus::Die`] event.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), ExecutorError>;

    /// Releases whatever the executor still holds for an exited container.
    async fn remove(&self, container_id: &str) -> Result<(), ExecutorError>;

    /// Receives container events from now on.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ContainerEvent>;
}

/// The environment a job's process sees: its own variables plus `PORT` and
/// `PORT_<n>` for each allocated port.
pub fn container_env(job: &Job, ports: &[u16]) -> BTreeMap<String, String> {
    let mut env = job.environment.clone();
    if let Some(first) = ports.first() {
        env.insert("PORT".to_string(), first.to_string());
    }
    for (i, port) in ports.iter().enumerate() {
        env.insert(format!("PORT_{i}"), port.to_string());
    }
    env
}

/// Fan-out of container events to every subscriber.
#[derive(Debug, Default)]
pub(crate) struct EventFanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ContainerEvent>>>,
}

impl EventFanout {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ContainerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn publish(&self, event: ContainerEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
