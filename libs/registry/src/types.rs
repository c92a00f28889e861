//! Registry data types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderType {
    /// The longest-registered instance leads.
    #[default]
    Oldest,
    /// Leadership is assigned explicitly.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub leader_type: LeaderType,
}

/// A registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub addr: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Registration order assigned by the registry.
    #[serde(default)]
    pub index: u64,
}

fn default_proto() -> String {
    "tcp".to_string()
}

impl Instance {
    /// Creates an instance with a fresh id.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            addr: addr.into(),
            proto: default_proto(),
            meta: BTreeMap::new(),
            index: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Index-guarded metadata stored per service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub data: serde_json::Value,
    /// Zero means the meta does not exist yet.
    #[serde(default)]
    pub index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Current,
    Up,
    Update,
    Down,
    Leader,
    ServiceMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service: String,
    pub kind: WatchKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_meta: Option<ServiceMeta>,
}

impl ServiceEvent {
    pub(crate) fn instance(service: &str, kind: WatchKind, instance: Instance) -> Self {
        Self {
            service: service.to_string(),
            kind,
            instance: Some(instance),
            service_meta: None,
        }
    }

    pub(crate) fn current(service: &str) -> Self {
        Self {
            service: service.to_string(),
            kind: WatchKind::Current,
            instance: None,
            service_meta: None,
        }
    }
}
