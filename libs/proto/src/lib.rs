//! # corral-proto
//!
//! The data model and wire protocol shared by the scheduler, host agents and
//! clients.
//!
//! ## Modules
//!
//! - [`types`]: jobs, hosts, placement rules, active jobs and cluster snapshots
//! - [`rpc`]: scheduler request/response messages
//! - [`codec`]: length-prefixed JSON framing for the scheduler port
//! - [`attach`]: byte-level constants and frames of the attach protocol
//!
//! ## Scheduler framing
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| JSON document (length B)  |
//! +----------------+---------------------------+
//! ```

pub mod attach;
pub mod codec;
mod error;
pub mod rpc;
pub mod types;

pub use codec::{ClientCodec, JsonCodec, ServerCodec, MAX_FRAME_LEN};
pub use error::ProtoError;
pub use rpc::{
    HostJobs, RejectReason, Rejection, Request, Response, RpcError, RpcErrorKind,
    ScheduleRequest, ScheduleResponse,
};
pub use types::{
    ActiveJob, ClusterSnapshot, Host, Job, Operator, PortRange, ResourceValue, Rule,
};

pub use corral_events::{Event, EventDetails, EventKind, JobStatus};
pub use corral_id::{HostId, JobId};
