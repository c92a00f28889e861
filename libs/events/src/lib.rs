//! # corral-events
//!
//! Job lifecycle events published by host agents.
//!
//! ## Design Principles
//!
//! - Events are immutable records of validated state transitions
//! - Every event belongs to exactly one job on exactly one host
//! - Events for one job are produced in transition order
//! - The event stream is the only way the scheduler and external watchers
//!   learn about host-side state changes
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► start ──► stop
//!    │
//!    └─────► error
//! ```
//!
//! `create` marks a job `starting`, `start` marks it `running`, `stop` marks it
//! `done` or `crashed` depending on the exit status and `error` marks it
//! `failed`.

mod error;
mod types;

pub use error::EventError;
pub use types::*;
