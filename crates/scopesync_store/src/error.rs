//! Error types for scope store operations.

use scopesync_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing scope metadata.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An I/O error occurred while opening the store.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored value could not be decoded.
    #[error("stored data corrupted: {0}")]
    Corrupted(String),

    /// A value was rejected before being written.
    #[error("invalid value: {0}")]
    Invalid(#[from] ProtocolError),

    /// A numeric value does not fit the storage representation.
    #[error("value out of range for column `{column}`: {value}")]
    OutOfRange {
        /// Column being written.
        column: &'static str,
        /// Rejected value.
        value: u64,
    },

    /// A scope definition was written by a newer release.
    #[error("scope `{scope}` has version {found}, newer than running version {running}")]
    UnsupportedVersion {
        /// Scope name.
        scope: String,
        /// Version found in the store.
        found: String,
        /// Version of this release.
        running: String,
    },

    /// A migration step failed or the registry is inconsistent.
    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupted(err.to_string())
    }
}
