//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID carries the prefix of another resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID has no `_` between prefix and UUID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The UUID portion did not parse.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

impl IdError {
    /// Returns true if the input named a different resource type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
