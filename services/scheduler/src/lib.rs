//! corral scheduler
//!
//! Places jobs on host agents. The scheduler keeps the authoritative cluster
//! state in memory, admits hosts over long-lived registration streams and
//! applies placement requests transactionally.
//!
//! ## Modules
//!
//! - `cluster`: copy-on-write cluster state with lock-free reads
//! - `rules`: placement rule evaluation
//! - `channels`: bounded outbound job channels per host
//! - `schedule`: Schedule / RegisterHost / RemoveJobs semantics
//! - `server`: TCP server for the RPC protocol
//! - `client`: typed client used by hosts, the CLI and tests

pub mod channels;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod rules;
pub mod schedule;
pub mod server;

pub use client::{ClientError, HostStream, SchedulerClient, StateStream};
pub use cluster::{Cluster, ClusterState, Transaction};
pub use error::{AdmissionError, InvariantViolation, SchedulerError};
pub use schedule::{HostRegistration, Scheduler, SchedulerOptions};
pub use server::serve;

/// Registry service the scheduler registers under.
pub const SERVICE_NAME: &str = "corral-scheduler";
