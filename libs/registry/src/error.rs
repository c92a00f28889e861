use thiserror::Error;

/// Errors returned by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("meta index conflict: expected {expected}, current {current}")]
    IndexConflict { expected: u64, current: u64 },

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("watch fell behind and missed {0} events")]
    Lagged(u64),

    #[error("malformed registry payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RegistryError {
    /// Whether the registry itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            RegistryError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            RegistryError::Unavailable(err.to_string())
        }
    }
}
