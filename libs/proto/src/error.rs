use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid port range {low}-{high}")]
    InvalidPortRange { low: u16, high: u16 },

    #[error("unknown attach frame type {0}")]
    UnknownFrame(u8),
}
