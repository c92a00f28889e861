//! # corral-id
//!
//! Identifier types for hosts and jobs.
//!
//! ## Design Principles
//!
//! - IDs are opaque strings; a submitter may choose its own job IDs
//! - Generated IDs use a prefixed format: `{prefix}_{ulid}`
//! - Parsing rejects values that cannot travel in a URL path segment
//! - IDs are typed so a `HostId` can never be passed where a `JobId` is expected
//!
//! Examples:
//! - `host_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `web-3f2a` (submitter-chosen job ID)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
