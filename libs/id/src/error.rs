//! Error types for ID parsing and validation.

use thiserror::Error;

/// Maximum length of an ID in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID exceeds [`MAX_ID_LEN`].
    #[error("ID is {len} bytes, maximum is {MAX_ID_LEN}")]
    TooLong { len: usize },

    /// The ID contains a character that is not allowed.
    #[error("invalid character {ch:?} in ID")]
    InvalidChar { ch: char },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}

/// Validates the textual form shared by every ID type.
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong { len: s.len() });
    }
    if let Some(ch) = s.chars().find(|c| c.is_whitespace() || c.is_control() || *c == '/') {
        return Err(IdError::InvalidChar { ch });
    }
    Ok(())
}
