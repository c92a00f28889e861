//! Error types for event handling.

use thiserror::Error;

use crate::EventKind;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An event does not follow the job lifecycle.
    #[error("invalid transition: {kind} after {previous:?}")]
    InvalidTransition {
        previous: Option<EventKind>,
        kind: EventKind,
    },
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
