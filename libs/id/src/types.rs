//! Typed ID definitions.

use crate::define_id;

#[doc(hidden)]
pub use crate::error::validate as validate_id;
pub use crate::error::MAX_ID_LEN;

// =============================================================================
// Cluster
// =============================================================================

define_id!(HostId, "host");
define_id!(JobId, "job");
