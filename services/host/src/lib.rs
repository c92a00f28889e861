//! corral host agent
//!
//! Runs the jobs the scheduler places on this machine. The agent keeps a
//! registration stream open to the scheduler, launches received jobs through
//! an [`Executor`], reports finished jobs back with `RemoveJobs` and exposes
//! job state and interactive I/O over HTTP.
//!
//! ## Modules
//!
//! - `state`: the job state table and its event log
//! - `ports`: host port allocation
//! - `executor`: container backends (local processes, scripted mock)
//! - `runner`: drives jobs through the executor
//! - `attach`: the attach protocol session
//! - `registration`: scheduler registration stream client
//! - `reconciler`: `RemoveJobs` for finished jobs
//! - `announcer`: service registry entries for running jobs
//! - `api`: HTTP API
//! - `client`: typed client for the HTTP API
//! - `agent`: composition of all of the above

pub mod agent;
pub mod announcer;
pub mod api;
pub mod attach;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod instance_id;
pub mod ports;
pub mod reconciler;
pub mod registration;
pub mod runner;
pub mod state;

pub use agent::{Agent, AgentOptions};
pub use attach::AttachService;
pub use client::{AttachSession, Attached, EventStream, HostClient, Transcript};
pub use error::{
    AttachError, ExecutorError, HostClientError, PortError, SchedulerLinkError, StateError,
};
pub use executor::{Executor, MockBehavior, MockExecutor, ProcessExecutor};
pub use ports::PortPool;
pub use registration::{BackoffPolicy, ConnectionState, RegistrationClient, SchedulerLocator};
pub use runner::Runner;
pub use state::{JobTable, StopAction};

/// Registry service host agents register under.
pub const SERVICE_NAME: &str = "corral-host";
