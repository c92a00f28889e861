//! # corral-registry
//!
//! The service registry as seen by the scheduler and host agents.
//!
//! The registry holds `service → {instance → metadata}`, emits events as
//! instances come and go, elects a leader per service and stores a small,
//! index-guarded metadata blob per service.
//!
//! ## Implementations
//!
//! - [`MemoryRegistry`]: in-process, used for single-node setups and tests
//! - [`HttpRegistry`]: client for a discoverd-style HTTP registry
//!
//! [`LeaderTracker`] follows a service's leader and the registry's
//! reachability in the background.

mod error;
mod heartbeat;
pub mod http;
mod leader;
pub mod memory;
mod sse;
mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::RegistryError;
pub use heartbeat::{Heartbeater, Lease};
pub use http::HttpRegistry;
pub use leader::{LeaderState, LeaderTracker};
pub use memory::MemoryRegistry;
pub use types::{Instance, LeaderType, ServiceConfig, ServiceEvent, ServiceMeta, WatchKind};

/// Stream of watch events for one service.
pub type EventStream = BoxStream<'static, Result<ServiceEvent, RegistryError>>;

/// Registration and lookup operations the cluster needs from a registry.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Creates a service. Creating an existing service succeeds.
    async fn add_service(&self, service: &str, config: ServiceConfig) -> Result<(), RegistryError>;

    /// Registers an instance; closing or dropping the returned heartbeater
    /// deregisters it.
    async fn register_instance(
        &self,
        service: &str,
        instance: Instance,
    ) -> Result<Heartbeater, RegistryError>;

    async fn instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError>;

    async fn leader(&self, service: &str) -> Result<Option<Instance>, RegistryError>;

    /// Yields `up` for every current instance, then `current`, then live events.
    async fn watch(&self, service: &str) -> Result<EventStream, RegistryError>;

    async fn get_meta(&self, service: &str) -> Result<Option<ServiceMeta>, RegistryError>;

    /// Stores `meta` if `meta.index` equals the current index (0 when unset).
    async fn set_meta(&self, service: &str, meta: ServiceMeta) -> Result<ServiceMeta, RegistryError>;

    /// Checks that the registry is reachable.
    async fn ping(&self) -> Result<(), RegistryError>;
}
