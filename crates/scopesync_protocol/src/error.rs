//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A scope definition violates its setup/schema invariant.
    #[error("invalid scope definition `{scope}`: {message}")]
    InvalidScope {
        /// Scope name.
        scope: String,
        /// Description of the violation.
        message: String,
    },

    /// A setup declares a dependency cycle or an unknown dependency.
    #[error("invalid setup: {0}")]
    InvalidSetup(String),

    /// A batch summary is not a well-formed part sequence.
    #[error("invalid batch summary: {0}")]
    InvalidSummary(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Creates an invalid scope error.
    pub fn invalid_scope(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidScope {
            scope: scope.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
